//! Linked Vocal Compressor
//!
//! # Perceptual Contract
//! - **Target Source**: A close-miked live vocal after tone shaping.
//! - **Intended Effect**: Controls peaks and evens out phrase level so the voice
//!   sits steadily on top of the backing track.
//! - **Failure Modes**:
//!   - "Pumping" when release is short and reduction is deep.
//!   - Dulled consonants when attack is near its minimum.
//! - **Will Not Do**:
//!   - Lookahead or brickwall limiting.
//!
//! # Lifecycle
//! - **Unprepared**: `process` is a no-op. Parameters set before `prepare` are
//!   cached and applied when it runs.
//! - **Active**: Normal operation.
//! - **Bypassed**: Passes audio through.
//!
//! # Gain Computer
//! Channels are linked: the detector sees the loudest channel of each frame, and
//! one gain is applied to all of them. Static curve with optional soft knee, then
//! attack/release smoothing of the linear gain, then makeup and parallel mix.
//!
//! # Types
//! [`CompressorType`] picks the detector, scales the user's attack and release,
//! and adds the type's coloration after the gain stage:
//!
//! | Type    | Detector            | Attack x | Release x | Color                       |
//! |---------|---------------------|----------|-----------|-----------------------------|
//! | Opto    | slow average, 40 ms | 3.0      | 2.0       | gentle tanh                 |
//! | FET     | peak                | 0.5      | 0.8       | drive grows with GR         |
//! | VCA     | RMS, 5 ms           | 1.0      | 1.0       | clean                       |
//! | Vintage | RMS, 5 ms           | 2.0      | 1.5       | 2nd/3rd harmonics, 0.85x GR |
//! | Peak    | peak                | 0.1      | 1.0       | clean                       |

use serde::{Deserialize, Serialize};

use crate::dsp::envelope::EnvelopeFollower;
use crate::dsp::utils::{db_to_gain, gain_to_db, sanitize, smoothing_coeff, DB_EPS};
use crate::dsp::{block_len, ProcessSpec};

// Parameter ranges.
const THRESHOLD_RANGE_DB: (f32, f32) = (-60.0, 0.0);
const RATIO_RANGE: (f32, f32) = (1.0, 20.0);
const ATTACK_RANGE_MS: (f32, f32) = (0.1, 100.0);
const RELEASE_RANGE_MS: (f32, f32) = (10.0, 1000.0);
const MAKEUP_RANGE_DB: (f32, f32) = (-12.0, 24.0);
const KNEE_RANGE_DB: (f32, f32) = (0.0, 24.0);
// Averaging windows of the non-peak detectors.
const RMS_WINDOW_MS: f32 = 5.0;
const OPTO_WINDOW_MS: f32 = 40.0;
// Reduction depth (dB) at which the FET drive is fully blended in.
const FET_DRIVE_FULL_DB: f32 = 40.0;
// Vintage units reduce a little less than the curve asks for.
const VINTAGE_GR_SCALE: f32 = 0.85;
// Gain reduction meter smoothing per block (0..1).
// Increasing: slower meter decay; decreasing: faster meter decay.
const METER_DECAY: f32 = 0.8;

/// Character of the compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressorType {
    Opto,
    #[serde(rename = "FET")]
    Fet,
    #[default]
    #[serde(rename = "VCA")]
    Vca,
    Vintage,
    Peak,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Detector {
    Peak,
    /// Root of a one-pole mean square.
    Rms(f32),
    /// One-pole average of the rectified signal.
    Average(f32),
}

impl CompressorType {
    fn detector(self) -> Detector {
        match self {
            CompressorType::Fet | CompressorType::Peak => Detector::Peak,
            CompressorType::Vca | CompressorType::Vintage => Detector::Rms(RMS_WINDOW_MS),
            CompressorType::Opto => Detector::Average(OPTO_WINDOW_MS),
        }
    }

    /// (attack, release) multipliers on the user's times.
    fn time_scale(self) -> (f32, f32) {
        match self {
            CompressorType::Opto => (3.0, 2.0),
            CompressorType::Fet => (0.5, 0.8),
            CompressorType::Vca => (1.0, 1.0),
            CompressorType::Vintage => (2.0, 1.5),
            CompressorType::Peak => (0.1, 1.0),
        }
    }

    fn gr_scale(self) -> f32 {
        match self {
            CompressorType::Vintage => VINTAGE_GR_SCALE,
            _ => 1.0,
        }
    }

    /// Post-gain coloration. `gr_db` is the current reduction (>= 0).
    #[inline]
    fn color(self, x: f32, gr_db: f32) -> f32 {
        match self {
            CompressorType::Vca | CompressorType::Peak => x,
            CompressorType::Opto => (x * 0.9).tanh() / 0.9,
            CompressorType::Fet => {
                let d = (gr_db / FET_DRIVE_FULL_DB).min(1.0);
                if d > 0.01 {
                    x * (1.0 - d) + (x * (1.0 + 2.0 * d)).tanh() * d
                } else {
                    x
                }
            }
            CompressorType::Vintage => {
                let warm = x + 0.1 * x * x - 0.05 * x * x * x;
                (warm * 0.95).tanh() / 0.95
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressorParams {
    #[serde(rename = "type")]
    pub kind: CompressorType,
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub makeup_db: f32,
    pub knee_db: f32,
    pub mix: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            kind: CompressorType::default(),
            threshold_db: -18.0,
            ratio: 3.0,
            attack_ms: 8.0,
            release_ms: 120.0,
            makeup_db: 0.0,
            knee_db: 0.0,
            mix: 1.0,
        }
    }
}

impl CompressorParams {
    pub fn clamped(self) -> Self {
        let d = Self::default();
        Self {
            kind: self.kind,
            threshold_db: sanitize(
                self.threshold_db,
                d.threshold_db,
                THRESHOLD_RANGE_DB.0,
                THRESHOLD_RANGE_DB.1,
            ),
            ratio: sanitize(self.ratio, d.ratio, RATIO_RANGE.0, RATIO_RANGE.1),
            attack_ms: sanitize(self.attack_ms, d.attack_ms, ATTACK_RANGE_MS.0, ATTACK_RANGE_MS.1),
            release_ms: sanitize(
                self.release_ms,
                d.release_ms,
                RELEASE_RANGE_MS.0,
                RELEASE_RANGE_MS.1,
            ),
            makeup_db: sanitize(self.makeup_db, d.makeup_db, MAKEUP_RANGE_DB.0, MAKEUP_RANGE_DB.1),
            knee_db: sanitize(self.knee_db, d.knee_db, KNEE_RANGE_DB.0, KNEE_RANGE_DB.1),
            mix: sanitize(self.mix, d.mix, 0.0, 1.0),
        }
    }
}

/// Static gain computer. Returns gain change in dB (<= 0) for a detector level.
pub fn gain_reduction_db(level_db: f32, threshold_db: f32, ratio: f32, knee_db: f32) -> f32 {
    let over = level_db - threshold_db;
    let slope = 1.0 / ratio.max(1.0) - 1.0;
    if knee_db > 0.0 && 2.0 * over.abs() <= knee_db {
        let x = over + knee_db * 0.5;
        slope * x * x / (2.0 * knee_db)
    } else if over > 0.0 {
        slope * over
    } else {
        0.0
    }
}

pub struct CompressorProcessor {
    params: CompressorParams,
    bypassed: bool,
    prepared: bool,
    sample_rate: f32,
    envelope: EnvelopeFollower,
    detector: Detector,
    detector_coeff: f32,
    detector_state: f32,
    makeup: f32,
    gain_reduction_db: f32,
}

impl Default for CompressorProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressorProcessor {
    pub fn new() -> Self {
        Self {
            params: CompressorParams::default(),
            bypassed: false,
            prepared: false,
            sample_rate: 0.0,
            envelope: EnvelopeFollower::new(1.0),
            detector: CompressorType::default().detector(),
            detector_coeff: 1.0,
            detector_state: 0.0,
            makeup: 1.0,
            gain_reduction_db: 0.0,
        }
    }

    pub fn prepare(&mut self, spec: &ProcessSpec) {
        if !spec.is_valid() {
            self.prepared = false;
            return;
        }
        self.sample_rate = spec.sample_rate as f32;
        self.prepared = true;
        self.apply_params();
        self.reset();
    }

    pub fn reset(&mut self) {
        self.envelope.reset();
        self.detector_state = 0.0;
        self.gain_reduction_db = 0.0;
    }

    pub fn set_params(&mut self, params: CompressorParams) {
        self.params = params.clamped();
        if self.prepared {
            self.apply_params();
        }
    }

    pub fn params(&self) -> CompressorParams {
        self.params
    }

    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// Smoothed gain reduction of the last processed block (dB, >= 0).
    pub fn gain_reduction_db(&self) -> f32 {
        self.gain_reduction_db
    }

    pub fn process(&mut self, block: &mut [&mut [f32]]) {
        if !self.prepared || self.bypassed {
            return;
        }
        let n = block_len(block);
        if n == 0 {
            return;
        }
        let CompressorParams {
            kind,
            threshold_db,
            ratio,
            knee_db,
            mix,
            ..
        } = self.params;
        let dry_mix = 1.0 - mix;
        let wet = mix * self.makeup;
        let gr_scale = kind.gr_scale();
        let mut min_gain = 1.0f32;

        for i in 0..n {
            let peak = block.iter().fold(0.0f32, |m, ch| m.max(ch[i].abs()));
            let level = self.detect(peak);
            let level_db = 20.0 * (level + DB_EPS).log10();
            let gr = gain_reduction_db(level_db, threshold_db, ratio, knee_db) * gr_scale;
            let gain = self.envelope.next(db_to_gain(gr));
            min_gain = min_gain.min(gain);

            if kind == CompressorType::Vca || kind == CompressorType::Peak {
                let applied = dry_mix + wet * gain;
                for ch in block.iter_mut() {
                    ch[i] *= applied;
                }
            } else {
                let gr_db = -gain_to_db(gain);
                for ch in block.iter_mut() {
                    let x = ch[i];
                    ch[i] = dry_mix * x + wet * kind.color(x * gain, gr_db);
                }
            }
        }

        let block_gr = -gain_to_db(min_gain);
        self.gain_reduction_db = if block_gr > self.gain_reduction_db {
            block_gr
        } else {
            METER_DECAY * self.gain_reduction_db + (1.0 - METER_DECAY) * block_gr
        };
    }

    /// Detector level for the loudest rectified sample of a frame.
    #[inline]
    fn detect(&mut self, peak: f32) -> f32 {
        match self.detector {
            Detector::Peak => peak,
            Detector::Rms(_) => {
                self.detector_state += (peak * peak - self.detector_state) * self.detector_coeff;
                self.detector_state.max(0.0).sqrt()
            }
            Detector::Average(_) => {
                self.detector_state += (peak - self.detector_state) * self.detector_coeff;
                self.detector_state
            }
        }
    }

    fn apply_params(&mut self) {
        let p = self.params;
        let (attack_x, release_x) = p.kind.time_scale();
        self.envelope.set_times(
            p.attack_ms * attack_x,
            p.release_ms * release_x,
            self.sample_rate,
        );
        let detector = p.kind.detector();
        if detector != self.detector {
            self.detector_state = 0.0;
        }
        self.detector = detector;
        self.detector_coeff = match detector {
            Detector::Peak => 1.0,
            Detector::Rms(ms) | Detector::Average(ms) => smoothing_coeff(ms, self.sample_rate),
        };
        self.makeup = db_to_gain(p.makeup_db);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::test_util::{rms, run_blocks, sine, stereo_spec, BLOCK, SR};

    fn render(params: CompressorParams, input: &[f32]) -> Vec<f32> {
        let mut comp = CompressorProcessor::new();
        comp.prepare(&stereo_spec());
        comp.set_params(params);
        let mut l = input.to_vec();
        let mut r = input.to_vec();
        run_blocks(&mut l, &mut r, BLOCK, |b| comp.process(b));
        l
    }

    #[test]
    fn higher_ratio_never_raises_level() {
        let input = sine(200.0, 0.8, 24_000, SR);
        let mut prev = f32::MAX;
        for ratio in [1.0, 2.0, 4.0, 8.0, 20.0] {
            let out = render(
                CompressorParams {
                    threshold_db: -20.0,
                    ratio,
                    ..CompressorParams::default()
                },
                &input,
            );
            let level = rms(&out[12_000..]);
            assert!(level <= prev + 1e-6, "ratio {ratio}: {level} > {prev}");
            prev = level;
        }
    }

    #[test]
    fn unity_ratio_without_makeup_is_transparent() {
        let input = sine(300.0, 0.9, 4096, SR);
        let out = render(
            CompressorParams {
                ratio: 1.0,
                ..CompressorParams::default()
            },
            &input,
        );
        for (a, b) in out.iter().zip(&input) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn unprepared_is_a_no_op_and_params_are_cached() {
        let input = sine(300.0, 0.9, 1024, SR);
        let mut comp = CompressorProcessor::new();
        let p = CompressorParams {
            threshold_db: -40.0,
            ratio: 10.0,
            ..CompressorParams::default()
        };
        comp.set_params(p);
        let mut l = input.clone();
        let mut r = input.clone();
        run_blocks(&mut l, &mut r, BLOCK, |b| comp.process(b));
        assert_eq!(l, input);

        comp.prepare(&stereo_spec());
        assert_eq!(comp.params(), p);
        run_blocks(&mut l, &mut r, BLOCK, |b| comp.process(b));
        assert!(rms(&l[512..]) < rms(&input[512..]));
        assert!(comp.gain_reduction_db() > 1.0);
    }

    #[test]
    fn bypassed_passes_audio_through() {
        let input = sine(300.0, 0.9, 1024, SR);
        let mut comp = CompressorProcessor::new();
        comp.prepare(&stereo_spec());
        comp.set_bypassed(true);
        let mut l = input.clone();
        let mut r = input.clone();
        run_blocks(&mut l, &mut r, BLOCK, |b| comp.process(b));
        assert_eq!(l, input);
    }

    #[test]
    fn zero_mix_returns_dry_signal() {
        let input = sine(300.0, 0.9, 2048, SR);
        let out = render(
            CompressorParams {
                threshold_db: -40.0,
                ratio: 20.0,
                makeup_db: 12.0,
                mix: 0.0,
                ..CompressorParams::default()
            },
            &input,
        );
        assert_eq!(out, input);
    }

    #[test]
    fn soft_knee_is_continuous() {
        let below = gain_reduction_db(-22.0 - 1e-3, -18.0, 4.0, 8.0);
        let edge = gain_reduction_db(-22.0, -18.0, 4.0, 8.0);
        assert!((below - edge).abs() < 1e-3);
        let upper = gain_reduction_db(-14.0, -18.0, 4.0, 8.0);
        let hard = gain_reduction_db(-14.0, -18.0, 4.0, 0.0);
        assert!((upper - hard).abs() < 1e-4);
        assert_eq!(gain_reduction_db(-30.0, -18.0, 4.0, 0.0), 0.0);
    }

    const ALL_TYPES: [CompressorType; 5] = [
        CompressorType::Opto,
        CompressorType::Fet,
        CompressorType::Vca,
        CompressorType::Vintage,
        CompressorType::Peak,
    ];

    #[test]
    fn every_type_reduces_a_loud_vocal() {
        let input = sine(220.0, 0.9, 24_000, SR);
        for kind in ALL_TYPES {
            let mut comp = CompressorProcessor::new();
            comp.prepare(&stereo_spec());
            comp.set_params(CompressorParams {
                kind,
                threshold_db: -40.0,
                ratio: 10.0,
                ..CompressorParams::default()
            });
            let mut l = input.clone();
            let mut r = input.clone();
            run_blocks(&mut l, &mut r, BLOCK, |b| comp.process(b));
            assert!(l.iter().all(|v| v.is_finite()), "{kind:?}");
            assert!(rms(&l[12_000..]) < 0.5 * rms(&input[12_000..]), "{kind:?}");
            assert!(comp.gain_reduction_db() > 1.0, "{kind:?}");
        }
    }

    #[test]
    fn clean_types_are_transparent_at_unity_ratio() {
        let input = sine(300.0, 0.9, 4096, SR);
        for kind in ALL_TYPES {
            let out = render(
                CompressorParams {
                    kind,
                    ratio: 1.0,
                    ..CompressorParams::default()
                },
                &input,
            );
            let max_err = out
                .iter()
                .zip(&input)
                .fold(0.0f32, |m, (a, b)| m.max((a - b).abs()));
            match kind {
                CompressorType::Opto | CompressorType::Vintage => {
                    assert!(max_err > 1e-3, "{kind:?} should color the signal")
                }
                _ => assert!(max_err < 1e-6, "{kind:?}: {max_err}"),
            }
        }
    }

    #[test]
    fn peak_type_catches_onsets_sooner_than_vca() {
        let input = sine(1000.0, 0.9, 4096, SR);
        let onset_peak = |kind| {
            let out = render(
                CompressorParams {
                    kind,
                    threshold_db: -30.0,
                    ratio: 10.0,
                    ..CompressorParams::default()
                },
                &input,
            );
            out[48..96].iter().fold(0.0f32, |m, v| m.max(v.abs()))
        };
        let peak = onset_peak(CompressorType::Peak);
        let vca = onset_peak(CompressorType::Vca);
        assert!(peak < 0.5 * vca, "peak {peak} vs vca {vca}");
    }

    #[test]
    fn type_is_stored_under_its_display_name() {
        let params = CompressorParams {
            kind: CompressorType::Fet,
            ..CompressorParams::default()
        };
        let doc = serde_json::to_value(params).unwrap();
        assert_eq!(doc["type"], "FET");
        let back: CompressorParams = serde_json::from_value(doc).unwrap();
        assert_eq!(back.kind, CompressorType::Fet);
        let missing: CompressorParams = serde_json::from_str("{}").unwrap();
        assert_eq!(missing.kind, CompressorType::Vca);
    }

    #[test]
    fn silence_in_silence_out() {
        let out = render(
            CompressorParams {
                makeup_db: 12.0,
                ..CompressorParams::default()
            },
            &vec![0.0; 2048],
        );
        assert!(out.iter().all(|&v| v == 0.0));
        for kind in ALL_TYPES {
            let out = render(
                CompressorParams {
                    kind,
                    ..CompressorParams::default()
                },
                &vec![0.0; 512],
            );
            assert!(out.iter().all(|&v| v == 0.0), "{kind:?}");
        }
    }
}
