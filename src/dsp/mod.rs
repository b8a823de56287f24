//! PCM DSP primitives over 16-bit and 32-bit sample slices.
//!
//! Small pure functions: widen, scale, saturating add/subtract, clip,
//! normalise, and the single-pass VAD parameter extraction. All functions
//! accept zero-length input as a no-op; mismatched slice lengths are a
//! programming error (asserted in debug builds, truncated to the shorter
//! slice in release).

pub mod noise;

use serde::{Deserialize, Serialize};

#[inline]
fn clip_to_16_bit(val: i32) -> i16 {
    val.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

#[inline]
fn clip_to_32_bit(val: i64) -> i32 {
    val.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Widen 16-bit samples to 32 bits, multiplying by `factor`.
pub fn scale_i16_to_i32(input: &[i16], out: &mut [i32], factor: f64) {
    debug_assert_eq!(input.len(), out.len());
    for (src, dst) in input.iter().zip(out.iter_mut()) {
        *dst = (*src as f64 * factor) as i32;
    }
}

/// Widen 16-bit samples to 32 bits with a linear gain ramp from
/// `factor_start` to `factor_end` across the slice.
pub fn fade_i16_to_i32(input: &[i16], out: &mut [i32], factor_start: f64, factor_end: f64) {
    debug_assert_eq!(input.len(), out.len());
    if input.is_empty() {
        return;
    }
    let step = (factor_end - factor_start) / input.len() as f64;
    let mut factor = factor_start;
    for (src, dst) in input.iter().zip(out.iter_mut()) {
        *dst = (*src as f64 * factor) as i32;
        factor += step;
    }
}

/// Element-wise `acc += addend`, saturating at the i32 range.
pub fn add_i32(acc: &mut [i32], addend: &[i32]) {
    debug_assert_eq!(acc.len(), addend.len());
    for (a, b) in acc.iter_mut().zip(addend.iter()) {
        *a = clip_to_32_bit(*a as i64 + *b as i64);
    }
}

/// Element-wise `acc -= subtrahend`, saturating at the i32 range.
pub fn subtract_i32(acc: &mut [i32], subtrahend: &[i32]) {
    debug_assert_eq!(acc.len(), subtrahend.len());
    for (a, b) in acc.iter_mut().zip(subtrahend.iter()) {
        *a = clip_to_32_bit(*a as i64 - *b as i64);
    }
}

/// Multiply every sample by `factor` in place.
pub fn scale_i32(buf: &mut [i32], factor: f64) {
    for val in buf.iter_mut() {
        *val = (*val as f64 * factor) as i32;
    }
}

/// Scale so the peak magnitude equals `max_amplitude`. Silence is left
/// untouched.
pub fn normalize_to(buf: &mut [i32], max_amplitude: u16) {
    let peak = buf.iter().map(|v| v.unsigned_abs()).max().unwrap_or(0);
    if peak == 0 {
        return;
    }
    scale_i32(buf, max_amplitude as f64 / peak as f64);
}

/// Saturation-clip 32-bit samples into 16-bit output.
pub fn clip_i32_to_i16(input: &[i32], out: &mut [i16]) {
    debug_assert_eq!(input.len(), out.len());
    for (src, dst) in input.iter().zip(out.iter_mut()) {
        *dst = clip_to_16_bit(*src);
    }
}

/// Per-sample voice activity parameters of a PCM frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VadParameters {
    /// Sign changes per sample (0 to 1)
    pub zero_crossings_per_sample: f64,
    /// Mean squared sample value
    pub powerlevel_density_per_sample: f64,
}

/// Decision thresholds for [`vad_detected`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct VadThresholds {
    /// Zero-crossing rates above this are classified non-voice.
    pub zero_crossings_rate_threshold_hertz: f64,
    /// Power-density levels at or below this are classified non-voice.
    pub powerlevel_density_threshold_db: f64,
}

impl Default for VadThresholds {
    fn default() -> Self {
        Self {
            zero_crossings_rate_threshold_hertz: 10_000.0,
            powerlevel_density_threshold_db: -10.0,
        }
    }
}

/// Compute zero-crossing rate and power density in one pass.
pub fn vad_parameters(samples: &[i16]) -> VadParameters {
    if samples.is_empty() {
        return VadParameters::default();
    }

    let mut zero_crossings = 0u64;
    let mut power = 0.0f64;
    let mut oldval = samples[0] as i64;

    for &sample in samples {
        let val = sample as i64;
        if val * oldval <= 0 {
            zero_crossings += 1;
        }
        power += (val * val) as f64;
        oldval = val;
    }

    let n = samples.len() as f64;
    VadParameters {
        zero_crossings_per_sample: zero_crossings as f64 / n,
        powerlevel_density_per_sample: power / n,
    }
}

/// [`vad_parameters`] over 32-bit samples.
pub fn vad_parameters_i32(samples: &[i32]) -> VadParameters {
    if samples.is_empty() {
        return VadParameters::default();
    }

    let mut zero_crossings = 0u64;
    let mut power = 0.0f64;
    let mut oldval = samples[0] as i64;

    for &sample in samples {
        let val = sample as i64;
        if val * oldval <= 0 {
            zero_crossings += 1;
        }
        power += (val * val) as f64;
        oldval = val;
    }

    let n = samples.len() as f64;
    VadParameters {
        zero_crossings_per_sample: zero_crossings as f64 / n,
        powerlevel_density_per_sample: power / n,
    }
}

/// Like [`vad_parameters`], additionally reporting the peak magnitude.
pub fn vad_parameters_with_peak(samples: &[i16]) -> (VadParameters, i16) {
    let params = vad_parameters(samples);
    let peak = samples
        .iter()
        .map(|v| v.unsigned_abs())
        .max()
        .unwrap_or(0)
        .min(i16::MAX as u16) as i16;
    (params, peak)
}

/// Voice decision: low zero-crossing rate and sufficient power density.
///
/// Voice requires the crossing rate (in Hz, at `rate_hz`) to stay at or
/// below the threshold and the power density level, `10·log10(density)`,
/// to exceed the dB threshold.
pub fn vad_detected(rate_hz: u32, params: VadParameters, thresholds: &VadThresholds) -> bool {
    let zero_crossings_hz = params.zero_crossings_per_sample * rate_hz as f64;
    if zero_crossings_hz > thresholds.zero_crossings_rate_threshold_hertz {
        return false;
    }

    let density_limit = 10f64.powf(thresholds.powerlevel_density_threshold_db / 10.0);
    params.powerlevel_density_per_sample > density_limit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_i16(amplitude: f64, freq_hz: f64, rate_hz: f64, samples: usize) -> Vec<i16> {
        (0..samples)
            .map(|i| {
                (amplitude * (2.0 * std::f64::consts::PI * freq_hz * i as f64 / rate_hz).sin())
                    as i16
            })
            .collect()
    }

    #[test]
    fn test_scale_widen() {
        let input = [100i16, -100, 0, i16::MAX];
        let mut out = [0i32; 4];
        scale_i16_to_i32(&input, &mut out, 1.0);
        assert_eq!(out, [100, -100, 0, 32767]);

        scale_i16_to_i32(&input, &mut out, 2.5);
        assert_eq!(out, [250, -250, 0, 81917]);
    }

    #[test]
    fn test_fade() {
        let input = [1000i16; 4];
        let mut out = [0i32; 4];
        fade_i16_to_i32(&input, &mut out, 0.0, 1.0);
        assert_eq!(out, [0, 250, 500, 750]);
    }

    #[test]
    fn test_add_saturates() {
        let mut acc = [i32::MAX, 5, i32::MIN];
        add_i32(&mut acc, &[1, 5, -1]);
        assert_eq!(acc, [i32::MAX, 10, i32::MIN]);
    }

    #[test]
    fn test_subtract_saturates() {
        let mut acc = [i32::MIN, 10];
        subtract_i32(&mut acc, &[1, 4]);
        assert_eq!(acc, [i32::MIN, 6]);
    }

    #[test]
    fn test_clip() {
        let input = [40_000, -40_000, 123, 0];
        let mut out = [0i16; 4];
        clip_i32_to_i16(&input, &mut out);
        assert_eq!(out, [i16::MAX, i16::MIN, 123, 0]);
    }

    #[test]
    fn test_normalize() {
        let mut buf = [100, -400, 200];
        normalize_to(&mut buf, 10_000);
        assert_eq!(buf, [2_500, -10_000, 5_000]);

        // Silence stays silence
        let mut silent = [0i32; 8];
        normalize_to(&mut silent, 10_000);
        assert_eq!(silent, [0; 8]);
    }

    #[test]
    fn test_zero_length_noops() {
        scale_i16_to_i32(&[], &mut [], 1.0);
        add_i32(&mut [], &[]);
        scale_i32(&mut [], 2.0);
        clip_i32_to_i16(&[], &mut []);
        normalize_to(&mut [], 100);
        assert_eq!(vad_parameters(&[]), VadParameters::default());
    }

    #[test]
    fn test_vad_parameters_sine() {
        // 1 kHz at 48 kHz crosses zero twice per period
        let samples = sine_i16(10_000.0, 1_000.0, 48_000.0, 960);
        let params = vad_parameters(&samples);

        let zc_hz = params.zero_crossings_per_sample * 48_000.0;
        assert!((zc_hz - 2_000.0).abs() < 200.0, "zc_hz = {zc_hz}");
        // Mean square of a sine is A²/2
        let expected = 10_000.0f64 * 10_000.0 / 2.0;
        assert!((params.powerlevel_density_per_sample - expected).abs() / expected < 0.05);
    }

    #[test]
    fn test_vad_decision() {
        let thresholds = VadThresholds::default();

        // Voiced: low crossing rate, high power
        let voice = vad_parameters(&sine_i16(10_000.0, 440.0, 48_000.0, 960));
        assert!(vad_detected(48_000, voice, &thresholds));

        // Hiss: sign alternates every sample, crossing rate = sample rate
        let hiss: Vec<i16> = (0..960).map(|i| if i % 2 == 0 { 500 } else { -500 }).collect();
        assert!(!vad_detected(48_000, vad_parameters(&hiss), &thresholds));

        // Near-silence: low crossing rate but no power
        let quiet = vad_parameters(&[0i16; 960]);
        assert!(!vad_detected(48_000, quiet, &thresholds));
    }

    #[test]
    fn test_peak_extraction() {
        let (_, peak) = vad_parameters_with_peak(&[10, -300, 250]);
        assert_eq!(peak, 300);
    }
}
