//! Gain Envelope and Parameter Ramps
//!
//! Shared smoothing primitives for the dynamics stages.
//!
//! # Design Notes
//! - `EnvelopeFollower` moves a gain toward a per-sample target with separate
//!   attack (moving down, more reduction) and release (moving up) speeds
//! - `LinearRamp` slews a control value over a fixed duration to avoid zipper clicks
//! - **No Allocations**: plain stack state, safe on the audio thread

use crate::dsp::utils::smoothing_coeff;

/// Exponential attack/release smoother over a gain value.
///
/// Each step advances `level += (target - level) * coeff`, using the attack
/// coefficient when the target lies below the current level.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeFollower {
    attack_coeff: f32,
    release_coeff: f32,
    level: f32,
    rest: f32,
}

impl EnvelopeFollower {
    /// Follower resting at `rest` (1.0 for a gain that starts with no reduction).
    pub fn new(rest: f32) -> Self {
        Self {
            attack_coeff: 1.0,
            release_coeff: 1.0,
            level: rest,
            rest,
        }
    }

    /// Derive both coefficients. Times are clamped before use.
    pub fn set_times(&mut self, attack_ms: f32, release_ms: f32, sample_rate: f32) {
        self.attack_coeff = smoothing_coeff(attack_ms, sample_rate);
        self.release_coeff = smoothing_coeff(release_ms, sample_rate);
    }

    #[inline]
    pub fn next(&mut self, target: f32) -> f32 {
        let coeff = if target < self.level {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.level += (target - self.level) * coeff;
        self.level
    }

    #[inline]
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = self.rest;
    }
}

/// Linear slew toward a target over a fixed number of samples.
#[derive(Debug, Clone, Copy)]
pub struct LinearRamp {
    current: f32,
    target: f32,
    step: f32,
    remaining: u32,
    length: u32,
}

impl LinearRamp {
    pub fn new(value: f32) -> Self {
        Self {
            current: value,
            target: value,
            step: 0.0,
            remaining: 0,
            length: 0,
        }
    }

    /// Set the ramp duration. Takes effect on the next `set_target`.
    pub fn prepare(&mut self, ramp_seconds: f64, sample_rate: f64) {
        self.length = (ramp_seconds * sample_rate).round().max(0.0) as u32;
    }

    /// Start a ramp toward `target`. Repeating the current target is a no-op.
    pub fn set_target(&mut self, target: f32) {
        if target == self.target {
            return;
        }
        self.target = target;
        if self.length == 0 {
            self.current = target;
            self.remaining = 0;
            return;
        }
        self.remaining = self.length;
        self.step = (target - self.current) / self.length as f32;
    }

    /// Jump to `value` with no ramp.
    pub fn snap(&mut self, value: f32) {
        self.current = value;
        self.target = value;
        self.remaining = 0;
    }

    #[inline]
    pub fn next(&mut self) -> f32 {
        if self.remaining > 0 {
            self.remaining -= 1;
            self.current = if self.remaining == 0 {
                self.target
            } else {
                self.current + self.step
            };
        }
        self.current
    }

    pub fn target(&self) -> f32 {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follower_uses_attack_downward_and_release_upward() {
        let mut env = EnvelopeFollower::new(1.0);
        env.set_times(1.0, 500.0, 48_000.0);

        for _ in 0..480 {
            env.next(0.25);
        }
        // 10 time constants of attack
        assert!((env.level() - 0.25).abs() < 1e-3);

        for _ in 0..480 {
            env.next(1.0);
        }
        // 10ms of a 500ms release barely moves
        assert!(env.level() < 0.3);

        env.reset();
        assert_eq!(env.level(), 1.0);
    }

    #[test]
    fn zero_times_do_not_produce_nan() {
        let mut env = EnvelopeFollower::new(1.0);
        env.set_times(0.0, -3.0, 44_100.0);
        let v = env.next(0.5);
        assert!(v.is_finite());
        assert!(v <= 1.0 && v >= 0.5);
    }

    #[test]
    fn ramp_reaches_target_exactly() {
        let mut ramp = LinearRamp::new(1.0);
        ramp.prepare(0.05, 1000.0);
        ramp.set_target(3.0);
        let mut last = 0.0;
        for _ in 0..50 {
            last = ramp.next();
        }
        assert_eq!(last, 3.0);
        assert_eq!(ramp.next(), 3.0);
    }

    #[test]
    fn repeated_target_does_not_restart() {
        let mut ramp = LinearRamp::new(0.0);
        ramp.prepare(0.01, 1000.0);
        ramp.set_target(1.0);
        for _ in 0..5 {
            ramp.next();
        }
        let mid = ramp.next();
        ramp.set_target(1.0);
        assert!(ramp.next() > mid);
    }
}
