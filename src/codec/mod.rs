//! Per-SSRC decoder registry.
//!
//! Amortises decoder construction and preserves per-stream Opus history
//! across frames. Entries are keyed by SSRC and evicted once idle longer
//! than a caller-chosen window. The map lives under a mutex; a borrowed
//! decoder never leaves the critical section that decodes one frame.

pub mod opus;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;

use crate::codec::opus::VoiceDecoder;
use crate::Error;

struct CodecEntry {
    decoder: VoiceDecoder,
    last_used: Instant,
}

/// SSRC-keyed cache of stateful decoders.
pub struct CodecRegistry {
    rate_hz: u32,
    lock_timeout: Duration,
    entries: Mutex<HashMap<u32, CodecEntry>>,
}

impl CodecRegistry {
    /// Create a registry constructing decoders for `rate_hz`.
    ///
    /// The rate is validated up front so construction failures inside the
    /// mixing path cannot be configuration mistakes.
    pub fn new(rate_hz: u32, lock_timeout: Duration) -> Result<Self, Error> {
        // Probe once; per-SSRC decoders reuse the validated rate
        VoiceDecoder::new(rate_hz)?;

        Ok(Self {
            rate_hz,
            lock_timeout,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Run `f` with the decoder for `ssrc`, creating it on first use.
    ///
    /// Updates the entry's last-used stamp on every access. Returns `None`
    /// when the registry lock cannot be taken within the configured
    /// timeout or the decoder cannot be constructed; callers treat that as
    /// a dropped frame.
    pub fn with_decoder<R>(&self, ssrc: u32, f: impl FnOnce(&mut VoiceDecoder) -> R) -> Option<R> {
        let mut entries = self.entries.try_lock_for(self.lock_timeout)?;

        if !entries.contains_key(&ssrc) {
            match VoiceDecoder::new(self.rate_hz) {
                Ok(decoder) => {
                    entries.insert(
                        ssrc,
                        CodecEntry {
                            decoder,
                            last_used: Instant::now(),
                        },
                    );
                }
                Err(err) => {
                    warn!("cannot create decoder for SSRC {ssrc}: {err}");
                    return None;
                }
            }
        }

        let entry = entries.get_mut(&ssrc)?;
        entry.last_used = Instant::now();
        Some(f(&mut entry.decoder))
    }

    /// Evict every entry idle longer than `max_idle`. Returns the number
    /// of evicted streams; a contended lock skips the sweep.
    pub fn garbage_collect(&self, max_idle: Duration) -> usize {
        let Some(mut entries) = self.entries.try_lock() else {
            return 0;
        };

        let before = entries.len();
        entries.retain(|ssrc, entry| {
            let stale = entry.last_used.elapsed() > max_idle;
            if stale {
                info!("removing stale stream {ssrc}");
            }
            !stale
        });

        before - entries.len()
    }

    /// Number of cached decoders.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
