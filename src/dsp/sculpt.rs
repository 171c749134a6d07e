//! Sculpt (Saturation + Corrective Tone)
//!
//! # Perceptual Contract
//! - **Intended Effect**: Adds harmonic density, then carves the two usual
//!   problem areas of a live vocal (mud and harshness) and opens up the top.
//! - **Failure Modes**:
//!   - Fizz on sibilants at high drive with air boosted.
//!   - Thin sound when mud cut is maxed on a thin voice.
//!
//! # Signal Path
//! 1. Saturation (Tube / Tape / Hybrid), skipped at idle drive.
//! 2. Mud dip, harsh dip, air shelf in series.
//!
//! All four controls are normalized 0..1.

use serde::{Deserialize, Serialize};

use crate::dsp::biquad::{FilterKind, FilterStage};
use crate::dsp::utils::{db_to_gain, sanitize};
use crate::dsp::{block_len, ProcessSpec};

// Mud dip centre (Hz) and width.
const MUD_FREQ_HZ: f32 = 300.0;
const MUD_Q: f32 = 1.5;
// Harsh dip centre (Hz) and width.
const HARSH_FREQ_HZ: f32 = 3500.0;
const HARSH_Q: f32 = 2.0;
// Air shelf corner (Hz) and slope.
const AIR_FREQ_HZ: f32 = 12_000.0;
const AIR_Q: f32 = 0.7;
// Full-scale depth of each tone control (dB).
const MUD_DEPTH_DB: f32 = 12.0;
const HARSH_DEPTH_DB: f32 = 12.0;
const AIR_DEPTH_DB: f32 = 10.0;
// Drive at or below this leaves the saturator out of the path.
const DRIVE_IDLE: f32 = 0.01;
// Even-harmonic bias for the Tape curve, and for the Tape half of Hybrid.
const TAPE_BIAS: f32 = 0.2;
const HYBRID_TAPE_BIAS: f32 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SaturationMode {
    Tube,
    Tape,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SculptParams {
    pub drive: f32,
    pub mud_cut: f32,
    pub harsh_cut: f32,
    pub air: f32,
    pub mode: SaturationMode,
}

impl Default for SculptParams {
    fn default() -> Self {
        Self {
            drive: 0.0,
            mud_cut: 0.0,
            harsh_cut: 0.0,
            air: 0.0,
            mode: SaturationMode::Hybrid,
        }
    }
}

impl SculptParams {
    pub fn clamped(self) -> Self {
        Self {
            drive: sanitize(self.drive, 0.0, 0.0, 1.0),
            mud_cut: sanitize(self.mud_cut, 0.0, 0.0, 1.0),
            harsh_cut: sanitize(self.harsh_cut, 0.0, 0.0, 1.0),
            air: sanitize(self.air, 0.0, 0.0, 1.0),
            mode: self.mode,
        }
    }
}

/// Static saturation curve for one sample.
#[inline]
pub fn saturate(x: f32, drive: f32, mode: SaturationMode) -> f32 {
    let drive_mult = 1.0 + drive * 2.0;
    let comp = 1.0 / (1.0 + drive * 0.5);
    let tube = |x: f32| (x * drive_mult).tanh() * comp;
    let tape = |x: f32, bias: f32| (x * drive_mult + bias * x * x).tanh() * comp;
    match mode {
        SaturationMode::Tube => tube(x),
        SaturationMode::Tape => tape(x, TAPE_BIAS),
        SaturationMode::Hybrid => 0.5 * tube(x) + 0.5 * tape(x, HYBRID_TAPE_BIAS),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ToneChain {
    mud: FilterStage,
    harsh: FilterStage,
    air: FilterStage,
}

pub struct SculptProcessor {
    params: SculptParams,
    bypassed: bool,
    sample_rate: f32,
    prepared: bool,
    chains: Vec<ToneChain>,
}

impl Default for SculptProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl SculptProcessor {
    pub fn new() -> Self {
        Self {
            params: SculptParams::default(),
            bypassed: false,
            sample_rate: 0.0,
            prepared: false,
            chains: Vec::new(),
        }
    }

    pub fn prepare(&mut self, spec: &ProcessSpec) {
        if !spec.is_valid() {
            self.prepared = false;
            return;
        }
        self.sample_rate = spec.sample_rate as f32;
        self.chains = vec![ToneChain::default(); spec.channel_count];
        self.prepared = true;
        self.update_filters();
    }

    pub fn reset(&mut self) {
        for c in &mut self.chains {
            c.mud.reset();
            c.harsh.reset();
            c.air.reset();
        }
    }

    pub fn set_params(&mut self, params: SculptParams) {
        self.params = params.clamped();
        self.update_filters();
    }

    pub fn params(&self) -> SculptParams {
        self.params
    }

    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    pub fn process(&mut self, block: &mut [&mut [f32]]) {
        if !self.prepared || self.bypassed {
            return;
        }
        let n = block_len(block);
        let SculptParams { drive, mode, .. } = self.params;
        let saturating = drive > DRIVE_IDLE;

        for (ch, chain) in block.iter_mut().zip(self.chains.iter_mut()) {
            for s in ch[..n].iter_mut() {
                let mut x = *s;
                if saturating {
                    x = saturate(x, drive, mode);
                }
                x = chain.mud.process_sample(x);
                x = chain.harsh.process_sample(x);
                *s = chain.air.process_sample(x);
            }
        }
    }

    fn update_filters(&mut self) {
        if !self.prepared {
            return;
        }
        let p = self.params;
        let sr = self.sample_rate;
        let mud_gain = db_to_gain(-MUD_DEPTH_DB * p.mud_cut);
        let harsh_gain = db_to_gain(-HARSH_DEPTH_DB * p.harsh_cut);
        let air_gain = db_to_gain(AIR_DEPTH_DB * p.air);
        for c in &mut self.chains {
            c.mud
                .set_coefficients(FilterKind::Peak, MUD_FREQ_HZ, MUD_Q, mud_gain, sr);
            c.harsh
                .set_coefficients(FilterKind::Peak, HARSH_FREQ_HZ, HARSH_Q, harsh_gain, sr);
            c.air
                .set_coefficients(FilterKind::HighShelf, AIR_FREQ_HZ, AIR_Q, air_gain, sr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::test_util::{run_blocks, sine, stereo_spec, BLOCK, SR};

    #[test]
    fn tube_at_full_drive_bounds_output() {
        let mut sculpt = SculptProcessor::new();
        sculpt.prepare(&stereo_spec());
        sculpt.set_params(SculptParams {
            drive: 1.0,
            mode: SaturationMode::Tube,
            ..SculptParams::default()
        });
        let input = sine(220.0, 0.9, 9600, SR);
        let mut l = input.clone();
        let mut r = input;
        run_blocks(&mut l, &mut r, BLOCK, |b| sculpt.process(b));
        let peak = l.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert!(peak <= 1.0, "peak {peak}");
        assert!(peak > 0.5);
    }

    #[test]
    fn zero_drive_with_neutral_tone_is_bit_identical() {
        let mut sculpt = SculptProcessor::new();
        sculpt.prepare(&stereo_spec());
        sculpt.set_params(SculptParams::default());
        let input = sine(440.0, 0.9, 4096, SR);
        let mut l = input.clone();
        let mut r = input.clone();
        run_blocks(&mut l, &mut r, BLOCK, |b| sculpt.process(b));
        assert_eq!(l, input);
        assert_eq!(r, input);
    }

    #[test]
    fn curves_pass_zero_and_stay_bounded() {
        for mode in [
            SaturationMode::Tube,
            SaturationMode::Tape,
            SaturationMode::Hybrid,
        ] {
            assert_eq!(saturate(0.0, 1.0, mode), 0.0);
            for &x in &[-4.0f32, -1.0, 0.5, 1.0, 4.0] {
                assert!(saturate(x, 1.0, mode).abs() <= 1.0);
            }
        }
    }

    #[test]
    fn silence_in_silence_out_with_everything_engaged() {
        let mut sculpt = SculptProcessor::new();
        sculpt.prepare(&stereo_spec());
        sculpt.set_params(SculptParams {
            drive: 0.8,
            mud_cut: 1.0,
            harsh_cut: 0.5,
            air: 1.0,
            mode: SaturationMode::Tape,
        });
        let mut l = vec![0.0f32; 1024];
        let mut r = vec![0.0f32; 1024];
        run_blocks(&mut l, &mut r, BLOCK, |b| sculpt.process(b));
        assert!(l.iter().chain(r.iter()).all(|&v| v == 0.0));
    }

    #[test]
    fn mud_cut_reaches_full_depth() {
        let mut sculpt = SculptProcessor::new();
        sculpt.prepare(&stereo_spec());
        sculpt.set_params(SculptParams {
            mud_cut: 1.0,
            ..SculptParams::default()
        });
        let mag = sculpt.chains[0].mud.magnitude_db(MUD_FREQ_HZ, SR as f32);
        assert!((mag + 12.0).abs() < 0.1);
    }
}
