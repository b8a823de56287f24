//! UDP socket setup for RTP reception.
//!
//! Sockets are configured through socket2 (address reuse, enlarged buffers,
//! multicast membership) and handed over as plain `std::net::UdpSocket` for
//! the receive loop. A short read timeout keeps receiver threads
//! responsive to shutdown.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::Error;

/// Receive timeout; bounds how long a receiver thread can sit in `recv`
/// before noticing its stop flag.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

const SOCKET_BUFFER_BYTES: usize = 1024 * 1024;

/// Create a UDP socket bound to `port` and joined to `group`.
///
/// `interface` selects the local interface for the multicast membership
/// (None = any). Group addresses outside the multicast range yield a plain
/// bound socket, which keeps loopback unicast setups working.
pub fn multicast_socket(
    group: Ipv4Addr,
    port: u16,
    interface: Option<Ipv4Addr>,
) -> Result<UdpSocket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    // Allow quick restarts and multiple listeners on the group
    socket.set_reuse_address(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into())?;

    let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES);

    let socket: UdpSocket = socket.into();

    if group.is_multicast() {
        let iface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.join_multicast_v4(&group, &iface)?;
    }

    socket.set_read_timeout(Some(RECV_TIMEOUT))?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unicast_bind() {
        let socket = multicast_socket(Ipv4Addr::LOCALHOST, 0, None).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_multicast_join() {
        let socket = multicast_socket(Ipv4Addr::new(239, 255, 0, 1), 0, None);
        assert!(socket.is_ok());
    }

    #[test]
    fn test_reuse_allows_two_listeners() {
        let group = Ipv4Addr::new(239, 255, 0, 2);
        let first = multicast_socket(group, 0, None).unwrap();
        let port = first.local_addr().unwrap().port();
        let second = multicast_socket(group, port, None);
        assert!(second.is_ok());
    }
}
