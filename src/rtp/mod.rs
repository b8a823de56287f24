//! RTP wire format, multicast sockets and ingest threads.

pub mod frame;
pub mod receiver;
pub mod socket;

pub use frame::{sequence_diff, sequence_older, RtpFrame, RtpFrameBuilder, RtpHeader};
pub use receiver::{FrameSink, RtpReceiver};
pub use socket::multicast_socket;
