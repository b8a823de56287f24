//! Crate-level error type.
//!
//! Only configuration and resource errors reach callers; transient
//! conditions (lock contention, a bad datagram, one failed decode) are
//! logged and absorbed where they occur.

use crate::rtp::frame::RtpParseError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected at construction time; the component refuses to start.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Socket or sink failure surfaced to the caller.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoder could not be constructed.
    #[error("codec error: {0}")]
    Codec(#[from] opus::Error),

    /// Malformed RTP data where a frame was required.
    #[error("rtp error: {0}")]
    Rtp(#[from] RtpParseError),
}
