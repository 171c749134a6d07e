//! Biquad Filter Stage (IIR 2nd Order)
//!
//! The second-order section behind every tone control in the chain: EQ bands,
//! sculpt dips, exciter high-pass, reverb low/high cuts and the dynamic EQ band.
//! Coefficients are derived from semantic parameters (kind, frequency, Q, gain)
//! and the sample rate using the RBJ cookbook formulas.
//!
//! # Design Notes
//! - Transposed direct form II, one instance per channel
//! - Coefficient updates never touch the delay state
//! - Shelf and peak stages collapse to identity when effectively flat
//! - State below the denormal floor is flushed to zero, so silence in means silence out

use std::f32::consts::PI;

/// Below this the shelf/peak stages are treated as flat.
const FLAT_GAIN_DB: f32 = 0.01;
/// Lowest design frequency (Hz).
const MIN_CUTOFF_HZ: f32 = 10.0;
/// Highest design frequency as a fraction of the sample rate.
const MAX_CUTOFF_RATIO: f32 = 0.49;
/// Delay state magnitude flushed to zero.
const DENORMAL_FLOOR: f32 = 1e-20;

/// Response shape of a [`FilterStage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    LowShelf,
    HighShelf,
    Peak,
    HighPass,
    LowPass,
}

/// Biquad filter (IIR 2nd order)
#[derive(Debug, Clone, Copy)]
pub struct FilterStage {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Default for FilterStage {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterStage {
    /// Identity filter with cleared state.
    pub fn new() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Process a single sample
    #[inline]
    pub fn process_sample(&mut self, input: f32) -> f32 {
        let out = input * self.b0 + self.z1;

        self.z1 = flush(input * self.b1 + self.z2 - self.a1 * out);
        self.z2 = flush(input * self.b2 - self.a2 * out);

        out
    }

    /// Filter a slice in place.
    pub fn process_block(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            *s = self.process_sample(*s);
        }
    }

    /// Clear delay state. Coefficient updates never call this.
    #[inline]
    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    /// Derive coefficients for `kind`.
    ///
    /// `linear_gain` only affects shelf and peak kinds. `q` is the resonance for
    /// every kind; a shelf at Q 0.707 has the maximally flat (slope 1) transition.
    pub fn set_coefficients(
        &mut self,
        kind: FilterKind,
        freq: f32,
        q: f32,
        linear_gain: f32,
        sample_rate: f32,
    ) {
        if !(sample_rate > 0.0) {
            self.set_identity();
            return;
        }

        let gain_db = 20.0 * linear_gain.max(1e-9).log10();
        let shaped = matches!(
            kind,
            FilterKind::LowShelf | FilterKind::HighShelf | FilterKind::Peak
        );
        if shaped && gain_db.abs() < FLAT_GAIN_DB {
            self.set_identity();
            return;
        }

        let cutoff = freq.clamp(MIN_CUTOFF_HZ, sample_rate * MAX_CUTOFF_RATIO);
        let q = q.max(1e-3);
        let w0 = 2.0 * PI * cutoff / sample_rate;
        let cw0 = w0.cos();
        let sw0 = w0.sin();
        let a = 10.0_f32.powf(gain_db / 40.0);

        let alpha = sw0 / (2.0 * q);

        let (b0, b1, b2, a0, a1, a2) = match kind {
            FilterKind::HighPass => {
                (
                    (1.0 + cw0) * 0.5,
                    -(1.0 + cw0),
                    (1.0 + cw0) * 0.5,
                    1.0 + alpha,
                    -2.0 * cw0,
                    1.0 - alpha,
                )
            }
            FilterKind::LowPass => {
                (
                    (1.0 - cw0) * 0.5,
                    1.0 - cw0,
                    (1.0 - cw0) * 0.5,
                    1.0 + alpha,
                    -2.0 * cw0,
                    1.0 - alpha,
                )
            }
            FilterKind::Peak => {
                (
                    1.0 + alpha * a,
                    -2.0 * cw0,
                    1.0 - alpha * a,
                    1.0 + alpha / a,
                    -2.0 * cw0,
                    1.0 - alpha / a,
                )
            }
            FilterKind::LowShelf => {
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) - (a - 1.0) * cw0 + two_sqrt_a_alpha),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cw0),
                    a * ((a + 1.0) - (a - 1.0) * cw0 - two_sqrt_a_alpha),
                    (a + 1.0) + (a - 1.0) * cw0 + two_sqrt_a_alpha,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cw0),
                    (a + 1.0) + (a - 1.0) * cw0 - two_sqrt_a_alpha,
                )
            }
            FilterKind::HighShelf => {
                let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) + (a - 1.0) * cw0 + two_sqrt_a_alpha),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cw0),
                    a * ((a + 1.0) + (a - 1.0) * cw0 - two_sqrt_a_alpha),
                    (a + 1.0) - (a - 1.0) * cw0 + two_sqrt_a_alpha,
                    2.0 * ((a - 1.0) - (a + 1.0) * cw0),
                    (a + 1.0) - (a - 1.0) * cw0 - two_sqrt_a_alpha,
                )
            }
        };

        let inv_a0 = 1.0 / a0;
        self.b0 = b0 * inv_a0;
        self.b1 = b1 * inv_a0;
        self.b2 = b2 * inv_a0;
        self.a1 = a1 * inv_a0;
        self.a2 = a2 * inv_a0;
    }

    /// Magnitude response in dB at `freq`.
    pub fn magnitude_db(&self, freq: f32, sample_rate: f32) -> f32 {
        if !(sample_rate > 0.0) {
            return 0.0;
        }
        let w = 2.0 * PI * freq / sample_rate;
        let (c1, s1) = (w.cos(), w.sin());
        let (c2, s2) = ((2.0 * w).cos(), (2.0 * w).sin());

        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);

        let num = num_re * num_re + num_im * num_im;
        let den = (den_re * den_re + den_im * den_im).max(1e-30);
        10.0 * (num / den).max(1e-30).log10()
    }

    fn set_identity(&mut self) {
        self.b0 = 1.0;
        self.b1 = 0.0;
        self.b2 = 0.0;
        self.a1 = 0.0;
        self.a2 = 0.0;
    }
}

#[inline]
fn flush(x: f32) -> f32 {
    if x.abs() < DENORMAL_FLOOR {
        0.0
    } else {
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48_000.0;

    #[test]
    fn flat_gain_is_identity() {
        let mut f = FilterStage::new();
        f.set_coefficients(FilterKind::Peak, 1000.0, 1.0, 1.0, SR);
        for &x in &[0.5, -0.25, 1.0, 0.0] {
            assert_eq!(f.process_sample(x), x);
        }
    }

    #[test]
    fn low_shelf_boosts_below_cutoff() {
        let mut f = FilterStage::new();
        f.set_coefficients(FilterKind::LowShelf, 500.0, 0.707, 2.0, SR);
        let dc = f.magnitude_db(1.0, SR);
        let top = f.magnitude_db(15_000.0, SR);
        assert!((dc - 6.02).abs() < 0.1, "dc gain {dc}");
        assert!(top.abs() < 0.1, "hf gain {top}");
    }

    #[test]
    fn high_pass_blocks_dc() {
        let mut f = FilterStage::new();
        f.set_coefficients(FilterKind::HighPass, 3000.0, 0.707, 1.0, SR);
        let mut last = 1.0;
        for _ in 0..4800 {
            last = f.process_sample(1.0);
        }
        assert!(last.abs() < 1e-3);
        assert!(f.magnitude_db(12_000.0, SR).abs() < 0.5);
    }

    #[test]
    fn silence_stays_silent_after_signal() {
        let mut f = FilterStage::new();
        f.set_coefficients(FilterKind::Peak, 300.0, 1.5, 0.25, SR);
        for i in 0..256 {
            f.process_sample((i as f32 * 0.1).sin());
        }
        let mut out = 1.0;
        for _ in 0..200_000 {
            out = f.process_sample(0.0);
        }
        assert_eq!(out, 0.0);
    }

    fn impulse_tail_rms(f: &mut FilterStage) -> f32 {
        let mut tail = 0.0f64;
        let total = 3 * SR as usize;
        let settle = 2 * SR as usize;
        for i in 0..total {
            let y = f.process_sample(if i == 0 { 1.0 } else { 0.0 });
            if i >= settle {
                tail += f64::from(y) * f64::from(y);
            }
        }
        (tail / (total - settle) as f64).sqrt() as f32
    }

    #[test]
    fn shelves_decay_at_high_q_and_full_gain() {
        for kind in [FilterKind::LowShelf, FilterKind::HighShelf] {
            for &(freq, q, db) in &[
                (100.0, 10.0, 24.0),
                (100.0, 10.0, -24.0),
                (10_000.0, 10.0, 24.0),
                (1000.0, 0.1, 24.0),
            ] {
                let mut f = FilterStage::new();
                f.set_coefficients(kind, freq, q, 10.0f32.powf(db / 20.0), SR);
                let tail = impulse_tail_rms(&mut f);
                assert!(tail < 1e-4, "{kind:?} {freq} Hz q {q} {db} dB rang at {tail}");
            }
        }
    }

    #[test]
    fn cutoff_above_nyquist_stays_stable() {
        let mut f = FilterStage::new();
        f.set_coefficients(FilterKind::LowPass, 40_000.0, 0.707, 1.0, SR);
        let mut peak = 0.0f32;
        for i in 0..4096 {
            let x = if i % 2 == 0 { 1.0 } else { -1.0 };
            peak = peak.max(f.process_sample(x).abs());
        }
        assert!(peak.is_finite());
        assert!(peak < 4.0);
    }
}
