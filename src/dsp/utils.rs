//! Level Conversions and Smoothing Helpers
//!
//! Small pure functions shared by every stage: dB/gain conversion, one-pole
//! coefficients, parameter sanitizing and the pan law.

/// Floor used before taking logarithms of levels.
pub const DB_EPS: f32 = 1e-6;

/// Shortest time constant accepted by the smoothers (ms).
pub const MIN_TIME_MS: f32 = 0.01;

#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    (10.0f32).powf(db / 20.0)
}

#[inline]
pub fn gain_to_db(gain: f32) -> f32 {
    20.0 * gain.max(DB_EPS).log10()
}

/// One-pole step coefficient `1 - exp(-1 / (ms * 0.001 * sr))`.
///
/// Non-positive times are clamped to [`MIN_TIME_MS`]; an unusable sample rate
/// yields 1.0 (jump straight to the target).
#[inline]
pub fn smoothing_coeff(time_ms: f32, sample_rate: f32) -> f32 {
    if !(sample_rate > 0.0) {
        return 1.0;
    }
    let ms = if time_ms.is_finite() {
        time_ms.max(MIN_TIME_MS)
    } else {
        MIN_TIME_MS
    };
    1.0 - (-1.0 / (ms * 0.001 * sample_rate)).exp()
}

/// RMS over the first `len` samples of every channel.
pub fn block_rms<S: AsRef<[f32]>>(channels: &[S], len: usize) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for ch in channels {
        for &v in ch.as_ref().iter().take(len) {
            sum += (v as f64) * (v as f64);
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt() as f32
}

/// Replace non-finite values with `fallback`, then clamp.
#[inline]
pub fn sanitize(value: f32, fallback: f32, min: f32, max: f32) -> f32 {
    let v = if value.is_finite() { value } else { fallback };
    v.clamp(min, max)
}

/// Constant-power pan law, `pan` in -1..1. Returns (left, right).
#[inline]
pub fn constant_power_pan(pan: f32) -> (f32, f32) {
    let p = pan.clamp(-1.0, 1.0);
    ((0.5 * (1.0 - p)).sqrt(), (0.5 * (1.0 + p)).sqrt())
}
