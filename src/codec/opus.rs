//! Opus decoder wrapper for conference speech streams.

use crate::Error;

/// Sample rates libopus accepts.
pub const OPUS_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

/// Stateful mono Opus decoder pinned to one stream.
///
/// Opus decoders carry inter-frame history; one instance must see all
/// frames of its stream, in order.
pub struct VoiceDecoder {
    decoder: opus::Decoder,
    rate_hz: u32,
}

impl VoiceDecoder {
    /// Create a decoder for `rate_hz`. Rejects rates libopus does not
    /// support.
    pub fn new(rate_hz: u32) -> Result<Self, Error> {
        if !OPUS_SAMPLE_RATES.contains(&rate_hz) {
            return Err(Error::Config(format!(
                "opus requires a sample rate of {OPUS_SAMPLE_RATES:?}, got {rate_hz}"
            )));
        }

        Ok(Self {
            decoder: opus::Decoder::new(rate_hz, opus::Channels::Mono)?,
            rate_hz,
        })
    }

    /// Decode one payload into `out`, returning the number of samples
    /// written.
    pub fn decode(&mut self, payload: &[u8], out: &mut [i16]) -> Result<usize, opus::Error> {
        self.decoder.decode(payload, out, false)
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }
}
