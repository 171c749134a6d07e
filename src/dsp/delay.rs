//! Feedback Delay
//!
//! # Perceptual Contract
//! - **Intended Effect**: Slap-back and rhythmic echoes on the vocal bus. Each
//!   repeat is darker and thinner than the last because the feedback path runs
//!   through a low cut and a high cut.
//! - **Failure Modes**:
//!   - Long, muddy tails when `stage` is near 0 and the cuts are wide open.
//! - **Will Not Do**:
//!   - Tempo sync or modulated (chorus) time.
//!   - Attenuate the dry signal.
//!
//! # Lifecycle
//! - **Unprepared**: `process` is a no-op. Parameters are cached.
//! - **Bypassed**: Passes audio through. The lines keep their contents.
//!
//! # Signal Flow
//! Per sample and channel, with `d` the delayed sample:
//! `fb = cuts(d * (1 - stage))`, widened in mid/side across the first two
//! channels, `line <- in + fb`, `out = in + d * ratio * mix`.
//! The first repeat of an impulse is therefore exactly `ratio * mix` loud.

use serde::{Deserialize, Serialize};

use crate::dsp::biquad::{FilterKind, FilterStage};
use crate::dsp::utils::sanitize;
use crate::dsp::{block_len, ProcessSpec};

const TIME_RANGE_MS: (f32, f32) = (1.0, 2000.0);
const WIDTH_RANGE: (f32, f32) = (0.0, 2.0);
const LOW_CUT_RANGE_HZ: (f32, f32) = (20.0, 2000.0);
const HIGH_CUT_RANGE_HZ: (f32, f32) = (2000.0, 20_000.0);
// Butterworth
const CUT_Q: f32 = 0.707;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DelayParams {
    pub delay_ms: f32,
    /// Level of the first repeat relative to the dry signal (0..1).
    pub ratio: f32,
    /// Loss per repeat (0..1). Feedback is `1 - stage`.
    pub stage: f32,
    /// Master level of the echoes (0..1).
    pub mix: f32,
    /// Side gain on the feedback path. 0 collapses repeats to mono.
    pub stereo_width: f32,
    pub low_cut_hz: f32,
    pub high_cut_hz: f32,
}

impl Default for DelayParams {
    fn default() -> Self {
        Self {
            delay_ms: 350.0,
            ratio: 0.5,
            stage: 0.25,
            mix: 1.0,
            stereo_width: 1.0,
            low_cut_hz: 200.0,
            high_cut_hz: 8000.0,
        }
    }
}

impl DelayParams {
    pub fn clamped(self) -> Self {
        let d = Self::default();
        Self {
            delay_ms: sanitize(self.delay_ms, d.delay_ms, TIME_RANGE_MS.0, TIME_RANGE_MS.1),
            ratio: sanitize(self.ratio, d.ratio, 0.0, 1.0),
            stage: sanitize(self.stage, d.stage, 0.0, 1.0),
            mix: sanitize(self.mix, d.mix, 0.0, 1.0),
            stereo_width: sanitize(self.stereo_width, d.stereo_width, WIDTH_RANGE.0, WIDTH_RANGE.1),
            low_cut_hz: sanitize(
                self.low_cut_hz,
                d.low_cut_hz,
                LOW_CUT_RANGE_HZ.0,
                LOW_CUT_RANGE_HZ.1,
            ),
            high_cut_hz: sanitize(
                self.high_cut_hz,
                d.high_cut_hz,
                HIGH_CUT_RANGE_HZ.0,
                HIGH_CUT_RANGE_HZ.1,
            ),
        }
    }
}

/// One channel's ring and feedback filters.
struct Line {
    buffer: Vec<f32>,
    low_cut: FilterStage,
    high_cut: FilterStage,
}

impl Line {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len],
            low_cut: FilterStage::new(),
            high_cut: FilterStage::new(),
        }
    }
}

pub struct DelayProcessor {
    params: DelayParams,
    bypassed: bool,
    prepared: bool,
    sample_rate: f32,
    lines: Vec<Line>,
    write_pos: usize,
    delay_samples: usize,
}

impl Default for DelayProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayProcessor {
    pub fn new() -> Self {
        Self {
            params: DelayParams::default(),
            bypassed: false,
            prepared: false,
            sample_rate: 0.0,
            lines: Vec::new(),
            write_pos: 0,
            delay_samples: 1,
        }
    }

    /// Allocates one line per channel, long enough for the longest time.
    pub fn prepare(&mut self, spec: &ProcessSpec) {
        if !spec.is_valid() {
            self.prepared = false;
            return;
        }
        self.sample_rate = spec.sample_rate as f32;
        let len = (TIME_RANGE_MS.1 * 0.001 * self.sample_rate).ceil() as usize + 1;
        self.lines = (0..spec.channel_count).map(|_| Line::new(len)).collect();
        self.prepared = true;
        self.apply_params();
        self.reset();
    }

    pub fn reset(&mut self) {
        for line in &mut self.lines {
            line.buffer.fill(0.0);
            line.low_cut.reset();
            line.high_cut.reset();
        }
        self.write_pos = 0;
    }

    pub fn set_params(&mut self, params: DelayParams) {
        self.params = params.clamped();
        if self.prepared {
            self.apply_params();
        }
    }

    pub fn params(&self) -> DelayParams {
        self.params
    }

    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// Current delay time in whole samples.
    pub fn delay_samples(&self) -> usize {
        self.delay_samples
    }

    pub fn process(&mut self, block: &mut [&mut [f32]]) {
        if !self.prepared || self.bypassed {
            return;
        }
        let n = block_len(block);
        let channels = block.len().min(self.lines.len());
        let Some(len) = self.lines.first().map(|l| l.buffer.len()) else {
            return;
        };
        let DelayParams {
            ratio,
            stage,
            mix,
            stereo_width,
            ..
        } = self.params;
        let feedback = 1.0 - stage;
        let wet = ratio * mix;
        let d = self.delay_samples;

        for i in 0..n {
            let w = self.write_pos;
            let read = (w + len - d) % len;
            let mut fb = [0.0f32; 2];

            for (c, line) in self.lines.iter_mut().enumerate().take(channels) {
                let input = block[c][i];
                let delayed = line.buffer[read];
                let shaped = line.low_cut.process_sample(delayed * feedback);
                let shaped = line.high_cut.process_sample(shaped);
                block[c][i] = input + delayed * wet;
                line.buffer[w] = input;
                match fb.get_mut(c) {
                    Some(slot) => *slot = shaped,
                    None => line.buffer[w] += shaped,
                }
            }

            // Width acts on the feedback of the first pair only.
            if channels >= 2 {
                let mid = (fb[0] + fb[1]) * 0.5;
                let side = (fb[0] - fb[1]) * 0.5 * stereo_width;
                fb = [mid + side, mid - side];
            }
            for (line, f) in self.lines.iter_mut().zip(fb).take(channels) {
                line.buffer[w] += f;
            }

            self.write_pos = (w + 1) % len;
        }
    }

    fn apply_params(&mut self) {
        let Some(len) = self.lines.first().map(|l| l.buffer.len()) else {
            return;
        };
        let samples = (self.params.delay_ms * 0.001 * self.sample_rate).round() as usize;
        self.delay_samples = samples.clamp(1, len - 1);
        let sr = self.sample_rate;
        for line in &mut self.lines {
            line.low_cut
                .set_coefficients(FilterKind::HighPass, self.params.low_cut_hz, CUT_Q, 1.0, sr);
            line.high_cut
                .set_coefficients(FilterKind::LowPass, self.params.high_cut_hz, CUT_Q, 1.0, sr);
        }
    }
}
