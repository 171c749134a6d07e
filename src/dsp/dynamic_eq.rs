//! Sidechain Ducker ("Dynamic EQ")
//!
//! # Perceptual Contract
//! - **Target Source**: The backing-track bus, keyed by the processed vocal bus.
//! - **Intended Effect**: Pulls the backing track down while the singer is
//!   above threshold and lets it recover between phrases.
//! - **Failure Modes**:
//!   - Audible breathing on the backing with short release and deep ratio.
//! - **Will Not Do**:
//!   - Band-limited ducking. Reduction is full-band; `shape` only scales its depth.
//!
//! # Algorithm (per block)
//! 1. RMS of the sidechain over all channels and samples, in dB.
//! 2. Above threshold: `(level - threshold) * (1 - 1/ratio)` dB of reduction.
//! 3. Per sample the envelope moves toward that target gain (attack down, release up).
//! 4. `gain = 1 - (1 - envelope) * (0.3 + 0.7 * shape)` applied to every channel.
//!
//! The band filter is designed from `duck_band_hz`/`q` for display
//! ([`DynamicEqProcessor::band_response_db`]) and is not in the audio path.

use serde::{Deserialize, Serialize};

use crate::dsp::biquad::{FilterKind, FilterStage};
use crate::dsp::envelope::EnvelopeFollower;
use crate::dsp::utils::{block_rms, db_to_gain, gain_to_db, sanitize, DB_EPS};
use crate::dsp::{block_len, ProcessSpec};

const BAND_RANGE_HZ: (f32, f32) = (100.0, 8000.0);
const Q_RANGE: (f32, f32) = (0.1, 10.0);
const THRESHOLD_RANGE_DB: (f32, f32) = (-60.0, 0.0);
const RATIO_RANGE: (f32, f32) = (1.0, 20.0);
const ATTACK_RANGE_MS: (f32, f32) = (0.1, 100.0);
const RELEASE_RANGE_MS: (f32, f32) = (10.0, 1000.0);
// Depth applied at shape = 0, reaching 1.0 at shape = 1.
const SHAPE_FLOOR: f32 = 0.3;
// Display depth of the band filter at full reduction (dB).
const BAND_DISPLAY_DEPTH_DB: f32 = -12.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DynamicEqParams {
    pub duck_band_hz: f32,
    pub q: f32,
    /// Ducking depth, 0..1 mapped onto 0.3..1.0.
    pub shape: f32,
    pub threshold: f32,
    pub ratio: f32,
    pub attack: f32,
    pub release: f32,
}

impl Default for DynamicEqParams {
    fn default() -> Self {
        Self {
            duck_band_hz: 1000.0,
            q: 2.0,
            shape: 0.5,
            threshold: -30.0,
            ratio: 4.0,
            attack: 10.0,
            release: 150.0,
        }
    }
}

impl DynamicEqParams {
    pub fn clamped(self) -> Self {
        let d = Self::default();
        Self {
            duck_band_hz: sanitize(self.duck_band_hz, d.duck_band_hz, BAND_RANGE_HZ.0, BAND_RANGE_HZ.1),
            q: sanitize(self.q, d.q, Q_RANGE.0, Q_RANGE.1),
            shape: sanitize(self.shape, d.shape, 0.0, 1.0),
            threshold: sanitize(self.threshold, d.threshold, THRESHOLD_RANGE_DB.0, THRESHOLD_RANGE_DB.1),
            ratio: sanitize(self.ratio, d.ratio, RATIO_RANGE.0, RATIO_RANGE.1),
            attack: sanitize(self.attack, d.attack, ATTACK_RANGE_MS.0, ATTACK_RANGE_MS.1),
            release: sanitize(self.release, d.release, RELEASE_RANGE_MS.0, RELEASE_RANGE_MS.1),
        }
    }

    #[inline]
    fn depth(&self) -> f32 {
        SHAPE_FLOOR + (1.0 - SHAPE_FLOOR) * self.shape
    }
}

pub struct DynamicEqProcessor {
    params: DynamicEqParams,
    bypassed: bool,
    prepared: bool,
    sample_rate: f32,
    envelope: EnvelopeFollower,
    band: FilterStage,
    last_gain: f32,
}

impl Default for DynamicEqProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicEqProcessor {
    pub fn new() -> Self {
        Self {
            params: DynamicEqParams::default(),
            bypassed: false,
            prepared: false,
            sample_rate: 0.0,
            envelope: EnvelopeFollower::new(1.0),
            band: FilterStage::new(),
            last_gain: 1.0,
        }
    }

    pub fn prepare(&mut self, spec: &ProcessSpec) {
        if !spec.is_valid() {
            self.prepared = false;
            return;
        }
        self.sample_rate = spec.sample_rate as f32;
        self.prepared = true;
        self.update_coefficients();
        self.reset();
    }

    pub fn reset(&mut self) {
        self.envelope.reset();
        self.band.reset();
        self.last_gain = 1.0;
    }

    pub fn set_params(&mut self, params: DynamicEqParams) {
        let params = params.clamped();
        if params == self.params {
            return;
        }
        self.params = params;
        self.update_coefficients();
    }

    pub fn params(&self) -> DynamicEqParams {
        self.params
    }

    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// Gain applied to the final sample of the last block.
    pub fn current_gain(&self) -> f32 {
        self.last_gain
    }

    /// Reduction applied to the final sample of the last block (dB, >= 0).
    pub fn gain_reduction_db(&self) -> f32 {
        -gain_to_db(self.last_gain)
    }

    /// Display curve of the duck band, scaled by the current reduction (dB).
    pub fn band_response_db(&self, freq: f32) -> f32 {
        if !self.prepared {
            return 0.0;
        }
        let amount = (1.0 - self.last_gain).clamp(0.0, 1.0);
        self.band.magnitude_db(freq, self.sample_rate) * amount
    }

    /// Duck `block` (the backing track) by the energy in `sidechain`.
    pub fn process<S: AsRef<[f32]>>(&mut self, block: &mut [&mut [f32]], sidechain: &[S]) {
        if !self.prepared || self.bypassed {
            return;
        }
        let n = block_len(block);
        if n == 0 {
            return;
        }

        let level_db = 20.0 * (block_rms(sidechain, n) + DB_EPS).log10();
        let p = self.params;
        let target = if level_db > p.threshold {
            db_to_gain(-(level_db - p.threshold) * (1.0 - 1.0 / p.ratio))
        } else {
            1.0
        };
        let depth = p.depth();

        for i in 0..n {
            let env = self.envelope.next(target);
            let gain = 1.0 - (1.0 - env) * depth;
            for ch in block.iter_mut() {
                ch[i] *= gain;
            }
            self.last_gain = gain;
        }
    }

    fn update_coefficients(&mut self) {
        if !self.prepared {
            return;
        }
        let p = self.params;
        self.envelope.set_times(p.attack, p.release, self.sample_rate);
        self.band.set_coefficients(
            FilterKind::Peak,
            p.duck_band_hz,
            p.q,
            db_to_gain(BAND_DISPLAY_DEPTH_DB),
            self.sample_rate,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::test_util::{sine, stereo_spec, BLOCK, SR};

    fn run(
        duck: &mut DynamicEqProcessor,
        backing: &mut [Vec<f32>; 2],
        vocal: &[Vec<f32>; 2],
    ) -> Vec<f32> {
        let mut gains = Vec::new();
        let len = backing[0].len();
        let mut start = 0;
        while start < len {
            let end = (start + BLOCK).min(len);
            let [bl, br] = &mut *backing;
            let mut block: [&mut [f32]; 2] = [&mut bl[start..end], &mut br[start..end]];
            let side = [&vocal[0][start..end], &vocal[1][start..end]];
            duck.process(&mut block, &side);
            gains.push(duck.current_gain());
            start = end;
        }
        gains
    }

    #[test]
    fn quiet_sidechain_leaves_backing_untouched() {
        let mut duck = DynamicEqProcessor::new();
        duck.prepare(&stereo_spec());
        let quiet = sine(300.0, 0.01, 8192, SR); // about -43 dBFS RMS
        let vocal = [quiet.clone(), quiet];
        let music = sine(150.0, 0.5, 8192, SR);
        let mut backing = [music.clone(), music.clone()];
        let gains = run(&mut duck, &mut backing, &vocal);
        assert!(gains.iter().all(|&g| g == 1.0));
        assert_eq!(backing[0], music);
    }

    #[test]
    fn loud_sidechain_ducks_then_releases() {
        let mut duck = DynamicEqProcessor::new();
        duck.prepare(&stereo_spec());
        duck.set_params(DynamicEqParams {
            shape: 1.0,
            ..DynamicEqParams::default()
        });

        let loud = sine(375.0, 0.7, 9600, SR);
        let vocal = [loud.clone(), loud];
        let mut backing = [vec![0.5; 9600], vec![0.5; 9600]];
        run(&mut duck, &mut backing, &vocal);

        // ~-6 dB RMS against -30 threshold at 4:1 -> 18 dB of reduction.
        let gr = duck.gain_reduction_db();
        assert!((gr - 18.0).abs() < 0.5, "reduction {gr}");
        assert_eq!(backing[0], backing[1]);

        let silent = [vec![0.0; 96_000], vec![0.0; 96_000]];
        let mut backing = [vec![0.5; 96_000], vec![0.5; 96_000]];
        run(&mut duck, &mut backing, &silent);
        assert!(duck.gain_reduction_db() < 0.01);
    }

    #[test]
    fn shape_scales_depth() {
        let loud = sine(375.0, 0.7, 9600, SR);
        let vocal = [loud.clone(), loud];
        let reduction = |shape: f32| {
            let mut duck = DynamicEqProcessor::new();
            duck.prepare(&stereo_spec());
            duck.set_params(DynamicEqParams {
                shape,
                ..DynamicEqParams::default()
            });
            let mut backing = [vec![1.0; 9600], vec![1.0; 9600]];
            run(&mut duck, &mut backing, &vocal);
            1.0 - duck.current_gain()
        };
        let shallow = reduction(0.0);
        let deep = reduction(1.0);
        assert!((shallow / deep - 0.3).abs() < 1e-3);
    }

    #[test]
    fn band_curve_is_display_only() {
        let mut duck = DynamicEqProcessor::new();
        duck.prepare(&stereo_spec());
        assert!(duck.band_response_db(1000.0).abs() < 1e-3);

        let loud = sine(375.0, 0.7, 4800, SR);
        let vocal = [loud.clone(), loud];
        let mut backing = [vec![0.5; 4800], vec![0.5; 4800]];
        run(&mut duck, &mut backing, &vocal);
        assert!(duck.band_response_db(1000.0) < -1.0);
        assert!(duck.band_response_db(1000.0) < duck.band_response_db(100.0));
    }

    #[test]
    fn bypassed_and_unprepared_are_no_ops() {
        let loud = sine(375.0, 0.7, 1024, SR);
        let vocal = [loud.clone(), loud];
        let mut duck = DynamicEqProcessor::new();
        let mut backing = [vec![0.5; 1024], vec![0.5; 1024]];
        run(&mut duck, &mut backing, &vocal);
        assert!(backing[0].iter().all(|&v| v == 0.5));

        duck.prepare(&stereo_spec());
        duck.set_bypassed(true);
        run(&mut duck, &mut backing, &vocal);
        assert!(backing[0].iter().all(|&v| v == 0.5));
    }
}
