//! White-noise frame generation for comfort noise.

use rand::Rng;

/// Generate `samples` of uniform white noise over `[-max_amplitude,
/// +max_amplitude]`.
///
/// The mixer calls this once at construction and re-emits the same frame
/// on every silent tick; constant low-level hiss is preferable to
/// per-tick variance.
pub fn white_noise_frame(samples: usize, max_amplitude: u16) -> Vec<i16> {
    let amplitude = max_amplitude.min(i16::MAX as u16) as i32;
    if amplitude == 0 {
        return vec![0; samples];
    }

    let mut rng = rand::thread_rng();
    (0..samples)
        .map(|_| rng.gen_range(-amplitude..=amplitude) as i16)
        .collect()
}
