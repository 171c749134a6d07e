//! Four-Voice Harmonizer
//!
//! Each voice is a plain value-parameterized lane: its own pitch shifter, its own
//! pre-delay line, a constant-power pan and a gain. The mono source is channel 0
//! of the incoming bus; voices are summed onto every channel at the wet level.
//!
//! # Lifecycle
//! - **Unprepared**: `process` is a no-op.
//! - **Bypassed / no voice enabled**: Passes audio through.
//!
//! Voice pitch glides toward its target once per block using `glide_ms`.

use serde::{Deserialize, Serialize};

use crate::dsp::pitch_shifter::GranularPitchShifter;
use crate::dsp::utils::{constant_power_pan, db_to_gain, sanitize};
use crate::dsp::{block_len, ProcessSpec};

pub const VOICE_COUNT: usize = 4;

const SEMITONE_RANGE: (f32, f32) = (-24.0, 24.0);
const VOICE_GAIN_RANGE_DB: (f32, f32) = (-60.0, 0.0);
const MAX_DELAY_MS: f32 = 200.0;
const WET_RANGE_DB: (f32, f32) = (-60.0, 6.0);
const GLIDE_RANGE_MS: (f32, f32) = (0.0, 500.0);
// Below this glide time the pitch jumps straight to the target.
const GLIDE_SNAP_MS: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceParams {
    pub enabled: bool,
    pub semitones: f32,
    pub pan: f32,
    pub gain_db: f32,
    pub delay_ms: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            enabled: false,
            semitones: 0.0,
            pan: 0.0,
            gain_db: 0.0,
            delay_ms: 0.0,
        }
    }
}

impl VoiceParams {
    fn preset(semitones: f32, pan: f32) -> Self {
        Self {
            semitones,
            pan,
            ..Self::default()
        }
    }

    pub fn clamped(self) -> Self {
        let d = Self::default();
        Self {
            enabled: self.enabled,
            semitones: sanitize(self.semitones, d.semitones, SEMITONE_RANGE.0, SEMITONE_RANGE.1),
            pan: sanitize(self.pan, d.pan, -1.0, 1.0),
            gain_db: sanitize(self.gain_db, d.gain_db, VOICE_GAIN_RANGE_DB.0, VOICE_GAIN_RANGE_DB.1),
            delay_ms: sanitize(self.delay_ms, d.delay_ms, 0.0, MAX_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HarmonizerParams {
    pub voices: [VoiceParams; VOICE_COUNT],
    pub wet_db: f32,
    pub glide_ms: f32,
}

impl Default for HarmonizerParams {
    fn default() -> Self {
        Self {
            voices: [
                VoiceParams::preset(3.0, -0.3),
                VoiceParams::preset(7.0, 0.3),
                VoiceParams::preset(-4.0, -0.6),
                VoiceParams::preset(12.0, 0.0),
            ],
            wet_db: 0.0,
            glide_ms: 50.0,
        }
    }
}

impl HarmonizerParams {
    pub fn clamped(self) -> Self {
        let d = Self::default();
        let mut voices = self.voices;
        for v in &mut voices {
            *v = v.clamped();
        }
        Self {
            voices,
            wet_db: sanitize(self.wet_db, d.wet_db, WET_RANGE_DB.0, WET_RANGE_DB.1),
            glide_ms: sanitize(self.glide_ms, d.glide_ms, GLIDE_RANGE_MS.0, GLIDE_RANGE_MS.1),
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.voices.iter().any(|v| v.enabled)
    }
}

/// Per-voice runtime state.
#[derive(Debug, Clone)]
struct VoiceLane {
    shifter: GranularPitchShifter,
    delay: Vec<f32>,
    delay_pos: usize,
    delay_samples: usize,
    semitones: f32,
    gain_l: f32,
    gain_r: f32,
}

impl VoiceLane {
    fn new() -> Self {
        Self {
            shifter: GranularPitchShifter::new(),
            delay: Vec::new(),
            delay_pos: 0,
            delay_samples: 0,
            semitones: 0.0,
            gain_l: 0.0,
            gain_r: 0.0,
        }
    }

    fn reset(&mut self) {
        self.shifter.reset();
        self.delay.iter_mut().for_each(|s| *s = 0.0);
        self.delay_pos = 0;
    }

    #[inline]
    fn next(&mut self, input: f32) -> f32 {
        let shifted = self.shifter.process_sample(input);
        if self.delay_samples == 0 || self.delay.is_empty() {
            return shifted;
        }
        let len = self.delay.len();
        let read = (self.delay_pos + len - self.delay_samples) % len;
        let out = self.delay[read];
        self.delay[self.delay_pos] = shifted;
        self.delay_pos = (self.delay_pos + 1) % len;
        out
    }
}

pub struct HarmonizerProcessor {
    params: HarmonizerParams,
    bypassed: bool,
    prepared: bool,
    sample_rate: f32,
    lanes: [VoiceLane; VOICE_COUNT],
    wet_gain: f32,
}

impl Default for HarmonizerProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl HarmonizerProcessor {
    pub fn new() -> Self {
        let params = HarmonizerParams::default();
        Self {
            params,
            bypassed: false,
            prepared: false,
            sample_rate: 0.0,
            lanes: std::array::from_fn(|_| VoiceLane::new()),
            wet_gain: db_to_gain(params.wet_db),
        }
    }

    pub fn prepare(&mut self, spec: &ProcessSpec) {
        if !spec.is_valid() {
            self.prepared = false;
            return;
        }
        self.sample_rate = spec.sample_rate as f32;
        let max_delay = (MAX_DELAY_MS * 0.001 * self.sample_rate).ceil() as usize + 1;
        for lane in &mut self.lanes {
            lane.delay = vec![0.0; max_delay];
        }
        self.prepared = true;
        self.apply_params();
        self.reset();
    }

    pub fn reset(&mut self) {
        for (lane, voice) in self.lanes.iter_mut().zip(self.params.voices.iter()) {
            lane.semitones = voice.semitones;
            lane.shifter.set_semitones(voice.semitones);
            lane.reset();
        }
    }

    pub fn set_params(&mut self, params: HarmonizerParams) {
        self.params = params.clamped();
        self.apply_params();
    }

    pub fn params(&self) -> HarmonizerParams {
        self.params
    }

    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// Current (gliding) pitch of voice `index` in semitones.
    pub fn voice_semitones(&self, index: usize) -> Option<f32> {
        self.lanes.get(index).map(|l| l.semitones)
    }

    pub fn process(&mut self, block: &mut [&mut [f32]]) {
        if !self.prepared || self.bypassed || !self.params.any_enabled() || block.is_empty() {
            return;
        }
        let n = block_len(block);
        if n == 0 {
            return;
        }
        self.glide(n);

        let voices = self.params.voices;
        let wet = self.wet_gain;
        for i in 0..n {
            let source = block[0][i];
            let (mut wl, mut wr) = (0.0f32, 0.0f32);
            for (lane, voice) in self.lanes.iter_mut().zip(voices.iter()) {
                if !voice.enabled {
                    continue;
                }
                let v = lane.next(source);
                wl += v * lane.gain_l;
                wr += v * lane.gain_r;
            }
            match &mut *block {
                [mono] => mono[i] += 0.5 * (wl + wr) * wet,
                [left, right, ..] => {
                    left[i] += wl * wet;
                    right[i] += wr * wet;
                }
                [] => {}
            }
        }
    }

    fn glide(&mut self, block_len: usize) {
        let glide_ms = self.params.glide_ms;
        let coeff = if glide_ms < GLIDE_SNAP_MS {
            1.0
        } else {
            let block_ms = block_len as f32 * 1000.0 / self.sample_rate;
            1.0 - (-block_ms / glide_ms).exp()
        };
        for (lane, voice) in self.lanes.iter_mut().zip(self.params.voices.iter()) {
            let target = voice.semitones;
            lane.semitones += (target - lane.semitones) * coeff;
            if (target - lane.semitones).abs() < 1e-3 {
                lane.semitones = target;
            }
            lane.shifter.set_semitones(lane.semitones);
        }
    }

    fn apply_params(&mut self) {
        self.wet_gain = db_to_gain(self.params.wet_db);
        let sr = self.sample_rate;
        for (lane, voice) in self.lanes.iter_mut().zip(self.params.voices.iter()) {
            let (pl, pr) = constant_power_pan(voice.pan);
            let g = db_to_gain(voice.gain_db);
            lane.gain_l = pl * g;
            lane.gain_r = pr * g;
            let wanted = (voice.delay_ms * 0.001 * sr).round() as usize;
            lane.delay_samples = wanted.min(lane.delay.len().saturating_sub(1));
        }
    }
}
