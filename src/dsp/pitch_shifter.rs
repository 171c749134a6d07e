//! Granular Pitch Shifter
//!
//! Two-tap overlap-add delay-line shifter: a phasor sweeps the read delay across a
//! window while two taps half a window apart crossfade with triangular weights.
//! One instance per harmony voice; voices share nothing.
//!
//! # Design Notes
//! - Fixed power-of-two ring (8192) allocated once at construction
//! - Ratio glides toward its target with a per-sample one-pole (0.999 / 0.001)
//! - Ratio 1.0 freezes the phasor, giving a pure fixed delay

/// Ring size in samples. Must stay a power of two.
pub const BUFFER_SIZE: usize = 8192;
/// Read window in samples.
pub const WINDOW_SIZE: usize = 4096;
// One-pole ratio smoothing per sample.
const RATIO_SMOOTHING: f32 = 0.999;

#[derive(Debug, Clone)]
pub struct GranularPitchShifter {
    buffer: Vec<f32>,
    write_pos: usize,
    phase: f32,
    current_ratio: f32,
    target_ratio: f32,
}

impl Default for GranularPitchShifter {
    fn default() -> Self {
        Self::new()
    }
}

impl GranularPitchShifter {
    pub fn new() -> Self {
        Self {
            buffer: vec![0.0; BUFFER_SIZE],
            write_pos: 0,
            phase: 0.0,
            current_ratio: 1.0,
            target_ratio: 1.0,
        }
    }

    /// Clear the ring and snap the ratio to its target.
    pub fn reset(&mut self) {
        self.buffer.iter_mut().for_each(|s| *s = 0.0);
        self.write_pos = 0;
        self.phase = 0.0;
        self.current_ratio = self.target_ratio;
    }

    pub fn set_semitones(&mut self, semitones: f32) {
        let st = if semitones.is_finite() { semitones } else { 0.0 };
        self.target_ratio = 2.0f32.powf(st / 12.0);
    }

    pub fn current_ratio(&self) -> f32 {
        self.current_ratio
    }

    pub fn target_ratio(&self) -> f32 {
        self.target_ratio
    }

    #[inline]
    pub fn process_sample(&mut self, input: f32) -> f32 {
        self.current_ratio =
            RATIO_SMOOTHING * self.current_ratio + (1.0 - RATIO_SMOOTHING) * self.target_ratio;

        self.buffer[self.write_pos] = input;

        let step = (1.0 - self.current_ratio) / WINDOW_SIZE as f32;
        self.phase = wrap_unit(self.phase + step);

        let phase_b = wrap_unit(self.phase + 0.5);
        let tap_a = self.read_tap(self.phase);
        let tap_b = self.read_tap(phase_b);
        let out = tap_a * triangle(self.phase) + tap_b * triangle(phase_b);

        self.write_pos = (self.write_pos + 1) & (BUFFER_SIZE - 1);
        out
    }

    pub fn process_block(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            *s = self.process_sample(*s);
        }
    }

    #[inline]
    fn read_tap(&self, phase: f32) -> f32 {
        let delay = phase * (WINDOW_SIZE - 1) as f32;
        let pos = self.write_pos as f32 - delay + BUFFER_SIZE as f32;
        let base = pos.floor();
        let frac = pos - base;
        let i0 = (base as usize) & (BUFFER_SIZE - 1);
        let i1 = (i0 + 1) & (BUFFER_SIZE - 1);
        self.buffer[i0] + (self.buffer[i1] - self.buffer[i0]) * frac
    }
}

#[inline]
fn wrap_unit(x: f32) -> f32 {
    let w = x - x.floor();
    // x.floor() rounding can leave exactly 1.0 for tiny negative x
    if w >= 1.0 {
        0.0
    } else {
        w
    }
}

#[inline]
fn triangle(phase: f32) -> f32 {
    1.0 - 2.0 * (phase - 0.5).abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_converges_back_to_unity() {
        let mut ps = GranularPitchShifter::new();
        ps.set_semitones(7.0);
        for _ in 0..20_000 {
            ps.process_sample(0.0);
        }
        assert!((ps.current_ratio() - 2.0f32.powf(7.0 / 12.0)).abs() < 1e-3);

        ps.set_semitones(0.0);
        for _ in 0..20_000 {
            ps.process_sample(0.0);
        }
        assert!((ps.current_ratio() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn unity_ratio_tracks_input_envelope() {
        let mut ps = GranularPitchShifter::new();
        let mut out = Vec::new();
        for _ in 0..(BUFFER_SIZE * 2) {
            out.push(ps.process_sample(0.5));
        }
        let tail = &out[BUFFER_SIZE..];
        assert!(tail.iter().all(|v| (v - 0.5).abs() < 1e-4));
    }

    #[test]
    fn shifted_output_stays_bounded() {
        let mut ps = GranularPitchShifter::new();
        ps.set_semitones(12.0);
        let mut peak = 0.0f32;
        for i in 0..48_000 {
            let x = 0.8 * (i as f32 * 0.05).sin();
            peak = peak.max(ps.process_sample(x).abs());
        }
        assert!(peak <= 0.8 + 1e-3);
        assert!(peak > 0.1);
    }

    #[test]
    fn silence_in_silence_out() {
        let mut ps = GranularPitchShifter::new();
        ps.set_semitones(-5.0);
        for _ in 0..10_000 {
            assert_eq!(ps.process_sample(0.0), 0.0);
        }
    }

    #[test]
    fn reset_clears_history() {
        let mut ps = GranularPitchShifter::new();
        for _ in 0..1000 {
            ps.process_sample(1.0);
        }
        ps.reset();
        assert_eq!(ps.process_sample(0.0), 0.0);
    }
}
