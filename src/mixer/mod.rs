//! RTP audio mixer engine.
//!
//! On every tick the mixer drains at most one frame per SSRC from its
//! frame buffer, decodes each through the per-SSRC codec registry, sums
//! the PCM in a 32-bit accumulator, normalises by the number of streams
//! actually mixed and writes one saturation-clipped 16-bit frame to the
//! sink. Ticks never block: contended locks skip the tick, decode
//! failures skip the frame. When nothing was mixable, a pre-generated
//! comfort-noise frame is emitted instead (if enabled).

pub mod frame_buffer;

use std::io::{ErrorKind, Write};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::codec::CodecRegistry;
use crate::dsp;
use crate::mixer::frame_buffer::{FrameBuffer, FrameBufferConfig, DEFAULT_MAX_STREAMS};
use crate::rtp::receiver::FrameSink;
use crate::rtp::frame::RtpFrame;
use crate::Error;

/// Mixer settings; field names match the recognised configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Decoded and mixed PCM rate.
    pub sample_rate_hertz: u32,
    /// Tick interval; determines the output frame length.
    pub frame_length_ms: u32,
    /// Frame buffer capacity per SSRC.
    pub max_num_frames_per_stream: usize,
    /// SSRC silently dropped from the mix (self-echo suppression).
    #[serde(alias = "ssid_to_cancel")]
    pub ssrc_to_cancel: Option<u32>,
    /// Peak amplitude of the comfort-noise frame; 0 disables comfort
    /// noise.
    pub comfort_noise_max_amplitude: u16,
    /// Bounded wait for the frame buffer and registry locks.
    pub lock_timeout_ms: u64,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate_hertz: crate::DEFAULT_SAMPLE_RATE_HZ,
            frame_length_ms: crate::DEFAULT_FRAME_LENGTH_MS,
            max_num_frames_per_stream: crate::DEFAULT_MAX_FRAMES_PER_STREAM,
            ssrc_to_cancel: None,
            comfort_noise_max_amplitude: 0,
            lock_timeout_ms: crate::DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

impl MixerConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.frame_length_ms == 0 {
            return Err(Error::Config("frame_length_ms must be positive".into()));
        }
        if self.max_num_frames_per_stream == 0 {
            return Err(Error::Config(
                "max_num_frames_per_stream must be positive".into(),
            ));
        }
        if self.comfort_noise_max_amplitude > i16::MAX as u16 {
            return Err(Error::Config(format!(
                "comfort_noise_max_amplitude {} exceeds the 16-bit sample range",
                self.comfort_noise_max_amplitude
            )));
        }
        Ok(())
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// What a tick produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixOutcome {
    /// A mixed frame was written; `streams` frames went into it.
    Mixed { streams: usize },
    /// No frame was mixable; comfort noise was written if enabled.
    Silent,
    /// The tick was skipped (buffer lock contended or a tick already in
    /// flight); comfort noise was written if enabled, so both skip paths
    /// keep the output cadence.
    Skipped,
}

struct Scratch {
    decoded16: Vec<i16>,
    decoded32: Vec<i32>,
    mixed32: Vec<i32>,
    out16: Vec<i16>,
    out_bytes: Vec<u8>,
}

/// The mixing engine. Stateless between ticks apart from the frame buffer
/// and the codec registry; share it as `Arc<Mixer>` between producers and
/// the tick driver.
pub struct Mixer {
    config: MixerConfig,
    frame_length_samples: usize,
    frames: FrameBuffer,
    codecs: CodecRegistry,
    comfort_noise: Option<Vec<i16>>,
    scratch: Mutex<Scratch>,
}

impl Mixer {
    /// Validate the configuration and build the mixer, including the
    /// comfort-noise prototype frame.
    pub fn new(config: MixerConfig) -> Result<Self, Error> {
        config.validate()?;

        let frame_length_samples =
            crate::samples_per_frame(config.frame_length_ms, config.sample_rate_hertz);

        let codecs = CodecRegistry::new(config.sample_rate_hertz, config.lock_timeout())?;

        let frames = FrameBuffer::new(FrameBufferConfig {
            max_frames_per_stream: config.max_num_frames_per_stream,
            max_streams: DEFAULT_MAX_STREAMS,
            lock_timeout: config.lock_timeout(),
        });

        let comfort_noise = (config.comfort_noise_max_amplitude > 0).then(|| {
            dsp::noise::white_noise_frame(frame_length_samples, config.comfort_noise_max_amplitude)
        });

        Ok(Self {
            scratch: Mutex::new(Scratch {
                decoded16: vec![0; frame_length_samples],
                decoded32: vec![0; frame_length_samples],
                mixed32: vec![0; frame_length_samples],
                out16: vec![0; frame_length_samples],
                out_bytes: Vec::with_capacity(frame_length_samples * 2),
            }),
            config,
            frame_length_samples,
            frames,
            codecs,
            comfort_noise,
        })
    }

    /// Output frame length in samples.
    pub fn frame_length_samples(&self) -> usize {
        self.frame_length_samples
    }

    /// Queue an RTP frame for the next tick. Frames that do not fit are
    /// dropped; producers never block on the mixer.
    pub fn add_frame(&self, frame: RtpFrame) {
        if let Some(rejected) = self.frames.add(frame) {
            debug!(
                "frame not buffered: SSRC {} seq {}",
                rejected.ssrc(),
                rejected.sequence()
            );
        }
    }

    /// Produce one output frame.
    ///
    /// Writes `frame_length_samples × 2` bytes (16-bit signed, host byte
    /// order) to `sink`, or nothing when the tick was skipped and comfort
    /// noise is disabled. A sink that accepts fewer bytes than offered
    /// loses the remainder of that frame; only genuine sink failures
    /// propagate.
    pub fn mix<W: Write>(&self, sink: &mut W) -> Result<MixOutcome, Error> {
        // A held scratch lock means a tick is still running; keep the
        // output cadence with a locally-built comfort-noise frame
        let Some(mut scratch) = self.scratch.try_lock() else {
            self.write_comfort_noise(sink, &mut Vec::new())?;
            return Ok(MixOutcome::Skipped);
        };
        let scratch = &mut *scratch;

        let Some(frames) = self.frames.drain_oldest() else {
            debug!("frame buffer contended, skipping tick");
            self.write_comfort_noise(sink, &mut scratch.out_bytes)?;
            return Ok(MixOutcome::Skipped);
        };

        scratch.mixed32.fill(0);
        let mut mixed_count = 0usize;

        for frame in &frames {
            if self.config.ssrc_to_cancel == Some(frame.ssrc()) {
                continue;
            }

            let decoded16 = &mut scratch.decoded16;
            let outcome = self
                .codecs
                .with_decoder(frame.ssrc(), |decoder| decoder.decode(frame.payload(), decoded16));

            match outcome {
                Some(Ok(n)) if n == self.frame_length_samples => {
                    dsp::scale_i16_to_i32(&scratch.decoded16, &mut scratch.decoded32, 1.0);
                    dsp::add_i32(&mut scratch.mixed32, &scratch.decoded32);
                    mixed_count += 1;
                }
                Some(Ok(n)) => debug!(
                    "SSRC {}: decoded {} samples, expected {}",
                    frame.ssrc(),
                    n,
                    self.frame_length_samples
                ),
                Some(Err(err)) => debug!("SSRC {}: decode failed: {err}", frame.ssrc()),
                None => debug!("SSRC {}: no decoder available", frame.ssrc()),
            }
        }

        if mixed_count == 0 {
            self.write_comfort_noise(sink, &mut scratch.out_bytes)?;
            return Ok(MixOutcome::Silent);
        }

        dsp::scale_i32(&mut scratch.mixed32, 1.0 / mixed_count as f64);
        dsp::clip_i32_to_i16(&scratch.mixed32, &mut scratch.out16);

        scratch.out_bytes.clear();
        for &sample in &scratch.out16 {
            scratch.out_bytes.extend_from_slice(&sample.to_ne_bytes());
        }
        write_frame(sink, &scratch.out_bytes)?;

        Ok(MixOutcome::Mixed {
            streams: mixed_count,
        })
    }

    fn write_comfort_noise<W: Write>(&self, sink: &mut W, out_bytes: &mut Vec<u8>) -> Result<(), Error> {
        if let Some(noise) = &self.comfort_noise {
            out_bytes.clear();
            for &sample in noise {
                out_bytes.extend_from_slice(&sample.to_ne_bytes());
            }
            write_frame(sink, out_bytes)?;
        }
        Ok(())
    }

    /// Evict codec entries idle longer than `max_idle` and reap drained
    /// streams from the frame buffer.
    pub fn garbage_collect(&self, max_idle: Duration) {
        self.codecs.garbage_collect(max_idle);
        self.frames.garbage_collect();
    }

    /// Number of SSRCs with a live decoder.
    pub fn active_streams(&self) -> usize {
        self.codecs.len()
    }
}

impl FrameSink for Mixer {
    fn deliver(&self, frame: RtpFrame) {
        self.add_frame(frame);
    }
}

/// Write one PCM frame, absorbing sink back-pressure.
///
/// A sink that stops accepting bytes mid-frame (a full ring, a saturated
/// pipe) costs the rest of that frame, like any other transient: logged
/// and dropped, never an error. Genuine I/O failures still propagate.
fn write_frame<W: Write>(sink: &mut W, bytes: &[u8]) -> Result<(), Error> {
    let mut written = 0;
    while written < bytes.len() {
        match sink.write(&bytes[written..]) {
            Ok(0) => {
                warn!(
                    "sink full, dropped {} of {} frame bytes",
                    bytes.len() - written,
                    bytes.len()
                );
                return Ok(());
            }
            Ok(n) => written += n,
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::frame::RtpFrameBuilder;

    fn sine_frame(samples: usize, amplitude: f64, freq_hz: f64, rate_hz: f64) -> Vec<i16> {
        (0..samples)
            .map(|i| {
                (amplitude * (2.0 * std::f64::consts::PI * freq_hz * i as f64 / rate_hz).sin())
                    as i16
            })
            .collect()
    }

    fn opus_frames(ssrc: u32, count: usize, pcm: &[i16]) -> Vec<RtpFrame> {
        let mut encoder =
            opus::Encoder::new(48_000, opus::Channels::Mono, opus::Application::Voip).unwrap();
        encoder.set_bitrate(opus::Bitrate::Bits(96_000)).unwrap();
        let mut builder = RtpFrameBuilder::new(ssrc, 96);
        (0..count)
            .map(|_| {
                let packet = encoder.encode_vec(pcm, 4000).unwrap();
                builder.build_frame(&packet, pcm.len() as u32)
            })
            .collect()
    }

    fn as_samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_invalid_config_refused() {
        assert!(Mixer::new(MixerConfig {
            frame_length_ms: 0,
            ..Default::default()
        })
        .is_err());
        assert!(Mixer::new(MixerConfig {
            sample_rate_hertz: 44_100,
            ..Default::default()
        })
        .is_err());
        assert!(Mixer::new(MixerConfig {
            max_num_frames_per_stream: 0,
            ..Default::default()
        })
        .is_err());
        assert!(Mixer::new(MixerConfig {
            comfort_noise_max_amplitude: 40_000,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_config_keys() {
        let config: MixerConfig = serde_json::from_str(
            r#"{"sample_rate_hertz": 16000, "ssid_to_cancel": 42}"#,
        )
        .unwrap();
        assert_eq!(config.sample_rate_hertz, 16_000);
        assert_eq!(config.ssrc_to_cancel, Some(42));
        // Omitted keys fall back to defaults
        assert_eq!(config.frame_length_ms, 20);
        assert_eq!(config.max_num_frames_per_stream, 10);
        assert_eq!(config.comfort_noise_max_amplitude, 0);
    }

    #[test]
    fn test_silent_tick_with_comfort_noise() {
        let mixer = Mixer::new(MixerConfig {
            comfort_noise_max_amplitude: 500,
            ..Default::default()
        })
        .unwrap();

        let mut first = Vec::new();
        assert_eq!(mixer.mix(&mut first).unwrap(), MixOutcome::Silent);
        assert_eq!(first.len(), mixer.frame_length_samples() * 2);
        assert!(as_samples(&first).iter().all(|&s| (-500..=500).contains(&s)));

        // The prototype frame is re-emitted, not regenerated
        let mut second = Vec::new();
        mixer.mix(&mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_full_ring_sink_does_not_error() {
        let mixer = Mixer::new(MixerConfig {
            comfort_noise_max_amplitude: 500,
            ..Default::default()
        })
        .unwrap();

        // Far too small for one frame: the write comes up short
        let (mut sink, _source) = crate::output::pcm_ring(16);
        assert_eq!(mixer.mix(&mut sink).unwrap(), MixOutcome::Silent);

        // Ring is now full; subsequent ticks still succeed
        assert_eq!(mixer.mix(&mut sink).unwrap(), MixOutcome::Silent);
    }

    #[test]
    fn test_concurrent_tick_skips_with_comfort_noise() {
        let mixer = Mixer::new(MixerConfig {
            comfort_noise_max_amplitude: 500,
            ..Default::default()
        })
        .unwrap();

        // Hold the scratch lock to simulate a tick in flight
        let guard = mixer.scratch.lock();
        let mut out = Vec::new();
        assert_eq!(mixer.mix(&mut out).unwrap(), MixOutcome::Skipped);
        // The skip path keeps the output cadence
        assert_eq!(out.len(), mixer.frame_length_samples() * 2);
        assert!(as_samples(&out).iter().all(|&s| (-500..=500).contains(&s)));
        drop(guard);

        let mut next = Vec::new();
        assert_eq!(mixer.mix(&mut next).unwrap(), MixOutcome::Silent);
        // Both paths emit the same prototype frame
        assert_eq!(out, next);
    }

    #[test]
    fn test_silent_tick_without_comfort_noise() {
        let mixer = Mixer::new(MixerConfig::default()).unwrap();
        let mut out = Vec::new();
        assert_eq!(mixer.mix(&mut out).unwrap(), MixOutcome::Silent);
        assert!(out.is_empty());
    }

    #[test]
    fn test_mix_two_streams_preserves_level() {
        let mixer = Mixer::new(MixerConfig::default()).unwrap();
        let pcm = sine_frame(960, 10_000.0, 1_000.0, 48_000.0);

        // Early frames absorb the encoder's initial transient
        for frame in opus_frames(100, 5, &pcm) {
            mixer.add_frame(frame);
        }
        for frame in opus_frames(200, 5, &pcm) {
            mixer.add_frame(frame);
        }

        let mut out = Vec::new();
        for _ in 0..5 {
            out.clear();
            assert_eq!(mixer.mix(&mut out).unwrap(), MixOutcome::Mixed { streams: 2 });
        }
        assert_eq!(out.len(), 960 * 2);

        // Averaging two copies of the same signal keeps the peak level
        let peak = as_samples(&out)
            .iter()
            .map(|s| s.unsigned_abs() as u32)
            .max()
            .unwrap();
        assert!(
            (9_500..=10_500).contains(&peak),
            "peak {peak} outside 10000 ±5%"
        );
    }

    #[test]
    fn test_self_echo_suppression() {
        let mixer = Mixer::new(MixerConfig {
            ssrc_to_cancel: Some(100),
            ..Default::default()
        })
        .unwrap();

        let pcm = sine_frame(960, 10_000.0, 1_000.0, 48_000.0);
        for frame in opus_frames(100, 1, &pcm) {
            mixer.add_frame(frame);
        }

        // Only the cancelled stream is present: nothing to mix
        let mut out = Vec::new();
        assert_eq!(mixer.mix(&mut out).unwrap(), MixOutcome::Silent);
        assert!(out.is_empty());
        // The cancelled SSRC never got a decoder
        assert_eq!(mixer.active_streams(), 0);
    }

    #[test]
    fn test_decode_failure_skips_frame_only() {
        let mixer = Mixer::new(MixerConfig::default()).unwrap();

        let pcm = sine_frame(960, 8_000.0, 440.0, 48_000.0);
        for frame in opus_frames(7, 1, &pcm) {
            mixer.add_frame(frame);
        }
        // Invalid Opus payload on a second stream
        let mut builder = RtpFrameBuilder::new(8, 96);
        mixer.add_frame(builder.build_frame(&[0xFF], 960));

        let mut out = Vec::new();
        assert_eq!(mixer.mix(&mut out).unwrap(), MixOutcome::Mixed { streams: 1 });
        assert_eq!(out.len(), 960 * 2);
    }

    #[test]
    fn test_gc_reaps_idle_decoders() {
        let mixer = Mixer::new(MixerConfig::default()).unwrap();
        let pcm = sine_frame(960, 8_000.0, 440.0, 48_000.0);
        for frame in opus_frames(42, 1, &pcm) {
            mixer.add_frame(frame);
        }
        let mut out = Vec::new();
        mixer.mix(&mut out).unwrap();
        assert_eq!(mixer.active_streams(), 1);

        std::thread::sleep(Duration::from_millis(30));
        mixer.garbage_collect(Duration::from_millis(10));
        assert_eq!(mixer.active_streams(), 0);
    }
}
