//! RTP ingest thread.
//!
//! One receiver per socket: reads datagrams into pooled buffers, parses
//! them as RTP frames and hands each frame to a subscriber. The thread is
//! the only writer into its buffers; parse rejects are counted and
//! dropped.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::pool::BytePool;
use crate::rtp::frame::RtpFrame;

/// Largest datagram the receiver accepts.
const MAX_DATAGRAM: usize = 2048;

/// Buffers kept warm per receiver.
const POOL_CAPACITY: usize = 32;

/// Subscriber for parsed RTP frames.
///
/// Implementations take ownership of the frame; the mixer queues it for the
/// next tick, the VAD dispatches it to its worker pool.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: RtpFrame);
}

/// Receiver statistics, updated with atomics.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    frames_received: AtomicU64,
    frames_rejected: AtomicU64,
}

impl ReceiverStats {
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected.load(Ordering::Relaxed)
    }
}

/// RTP ingest thread feeding a [`FrameSink`].
pub struct RtpReceiver {
    running: Arc<AtomicBool>,
    stats: Arc<ReceiverStats>,
    thread: Option<JoinHandle<()>>,
}

impl RtpReceiver {
    /// Start receiving on `socket`, delivering every parsed frame to
    /// `sink`. The socket must carry a read timeout (see
    /// [`crate::rtp::socket::multicast_socket`]) so the thread can observe
    /// its stop flag.
    pub fn spawn(name: &str, socket: UdpSocket, sink: Arc<dyn FrameSink>) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ReceiverStats::default());

        let thread_running = running.clone();
        let thread_stats = stats.clone();
        let thread = thread::Builder::new()
            .name(format!("rtp-rx-{name}"))
            .spawn(move || {
                receive_loop(socket, thread_running, thread_stats, sink);
            })?;

        Ok(Self {
            running,
            stats,
            thread: Some(thread),
        })
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Stop the receiver thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RtpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    stats: Arc<ReceiverStats>,
    sink: Arc<dyn FrameSink>,
) {
    let pool = BytePool::new(POOL_CAPACITY, MAX_DATAGRAM);

    while running.load(Ordering::SeqCst) {
        let mut buf = pool.take();
        buf.resize(MAX_DATAGRAM, 0);

        match socket.recv(&mut buf) {
            Ok(len) => {
                buf.truncate(len);
                match RtpFrame::parse(buf) {
                    Ok(frame) => {
                        stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        sink.deliver(frame);
                    }
                    Err(err) => {
                        stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                        debug!("dropping datagram: {err}");
                    }
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(ref e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("rtp receiver socket error, stopping: {e}");
                break;
            }
        }
    }
}
