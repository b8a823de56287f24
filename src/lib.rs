//! confmix: real-time RTP audio mixing core for voice conferencing.
//!
//! Ingests concurrent RTP streams carrying Opus-encoded speech, decodes each
//! to linear PCM, mixes them sample-by-sample on a periodic tick and writes
//! the mixed frame to a downstream byte sink. A voice-activity detector runs
//! on a parallel path and reports loop-level on/off transitions.
//!
//! ## Modules
//!
//! - **rtp**: RFC 3550 frame model, multicast sockets, ingest threads
//! - **mixer**: per-SSRC frame buffer and the mixing engine
//! - **codec**: per-SSRC Opus decoder registry with idle eviction
//! - **dsp**: 16/32-bit PCM primitives and VAD parameter extraction
//! - **vad**: per-loop voice detection with hysteresis
//! - **runtime**: worker pool and periodic tickers
//! - **output**: PCM sinks (any `io::Write`, plus a lock-free ring)

pub mod codec;
pub mod dsp;
mod error;
pub mod mixer;
pub mod output;
pub mod pool;
pub mod rtp;
pub mod runtime;
pub mod vad;

pub use error::Error;
pub use mixer::{MixOutcome, Mixer, MixerConfig};
pub use rtp::frame::RtpFrame;
pub use rtp::receiver::{FrameSink, RtpReceiver};
pub use vad::{VadConfig, VadCore, VadCoreConfig};

/// Default mixed/decoded PCM rate in Hz.
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 48_000;

/// Default frame length (and mixer tick interval) in milliseconds.
pub const DEFAULT_FRAME_LENGTH_MS: u32 = 20;

/// Default per-SSRC frame buffer capacity.
pub const DEFAULT_MAX_FRAMES_PER_STREAM: usize = 10;

/// Default bounded-wait timeout for shared-state locks.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 100;

/// Number of samples in one frame of `frame_ms` at `rate_hz`.
pub fn samples_per_frame(frame_ms: u32, rate_hz: u32) -> usize {
    ((frame_ms as u64 * rate_hz as u64 + 500) / 1000) as usize
}
