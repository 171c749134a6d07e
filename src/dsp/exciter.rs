//! High-Frequency Exciter
//!
//! # Perceptual Contract
//! - **Intended Effect**: "Air" and presence. High-passed content is driven into
//!   `tanh` to generate odd harmonics and added on top of the untouched signal.
//! - **Failure Modes**:
//!   - Brittle sibilance with high drive and a low cutoff.
//! - **Will Not Do**:
//!   - Crossfade dry and wet. The wet branch is purely additive.
//!
//! # Lifecycle
//! - **Unprepared**: `process` is a no-op.
//! - **Idle**: `mix <= 0.001` skips the whole wet branch.
//! - **Bypassed**: Passes audio through.
//!
//! The wet scratch is allocated in `prepare` at the maximum block size; longer
//! host blocks are processed in chunks of that size.

use serde::{Deserialize, Serialize};

use crate::dsp::biquad::{FilterKind, FilterStage};
use crate::dsp::envelope::LinearRamp;
use crate::dsp::utils::{db_to_gain, sanitize};
use crate::dsp::{block_len, ProcessSpec};

const FREQ_RANGE_HZ: (f32, f32) = (1000.0, 10_000.0);
const DRIVE_RANGE_DB: (f32, f32) = (0.0, 24.0);
// High-pass resonance (Butterworth).
const HPF_Q: f32 = 0.707;
// Drive ramp length (s).
// Increasing: softer drive changes; decreasing: snappier, risk of clicks.
const DRIVE_RAMP_SECONDS: f64 = 0.05;
// Mix at or below this is treated as off.
const MIX_IDLE: f32 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExciterParams {
    /// High-pass cutoff feeding the harmonic generator (Hz).
    pub frequency: f32,
    /// Drive into the saturator (dB). Stored as `amount`.
    #[serde(rename = "amount", alias = "driveDb")]
    pub drive_db: f32,
    /// Amount of generated harmonics added to the dry signal (0..1).
    pub mix: f32,
}

impl Default for ExciterParams {
    fn default() -> Self {
        Self {
            frequency: 3000.0,
            drive_db: 0.0,
            mix: 0.0,
        }
    }
}

impl ExciterParams {
    pub fn clamped(self) -> Self {
        let d = Self::default();
        Self {
            frequency: sanitize(self.frequency, d.frequency, FREQ_RANGE_HZ.0, FREQ_RANGE_HZ.1),
            drive_db: sanitize(self.drive_db, d.drive_db, DRIVE_RANGE_DB.0, DRIVE_RANGE_DB.1),
            mix: sanitize(self.mix, d.mix, 0.0, 1.0),
        }
    }
}

pub struct ExciterProcessor {
    params: ExciterParams,
    bypassed: bool,
    prepared: bool,
    sample_rate: f32,
    filters: Vec<FilterStage>,
    drive: LinearRamp,
    wet: Vec<Vec<f32>>,
}

impl Default for ExciterProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExciterProcessor {
    pub fn new() -> Self {
        let params = ExciterParams::default();
        Self {
            params,
            bypassed: false,
            prepared: false,
            sample_rate: 0.0,
            filters: Vec::new(),
            drive: LinearRamp::new(db_to_gain(params.drive_db)),
            wet: Vec::new(),
        }
    }

    pub fn prepare(&mut self, spec: &ProcessSpec) {
        if !spec.is_valid() {
            self.prepared = false;
            return;
        }
        self.sample_rate = spec.sample_rate as f32;
        self.filters = vec![FilterStage::new(); spec.channel_count];
        self.wet = vec![vec![0.0; spec.maximum_block_size]; spec.channel_count];
        self.drive.prepare(DRIVE_RAMP_SECONDS, spec.sample_rate);
        self.drive.snap(db_to_gain(self.params.drive_db));
        self.prepared = true;
        self.update_filters();
    }

    pub fn reset(&mut self) {
        for f in &mut self.filters {
            f.reset();
        }
        self.drive.snap(self.drive.target());
    }

    pub fn set_params(&mut self, params: ExciterParams) {
        let params = params.clamped();
        let cutoff_changed = params.frequency != self.params.frequency;
        self.params = params;
        self.drive.set_target(db_to_gain(params.drive_db));
        if cutoff_changed {
            self.update_filters();
        }
    }

    pub fn params(&self) -> ExciterParams {
        self.params
    }

    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    pub fn process(&mut self, block: &mut [&mut [f32]]) {
        if !self.prepared || self.bypassed || self.params.mix <= MIX_IDLE {
            return;
        }
        let n = block_len(block);
        let chunk = self.wet.first().map_or(0, Vec::len);
        if chunk == 0 {
            return;
        }
        let mut start = 0;
        while start < n {
            let end = (start + chunk).min(n);
            self.process_chunk(block, start, end);
            start = end;
        }
    }

    fn process_chunk(&mut self, block: &mut [&mut [f32]], start: usize, end: usize) {
        let len = end - start;
        let channels = block.len().min(self.wet.len());

        // Isolate the top end into the wet scratch.
        for c in 0..channels {
            let wet = &mut self.wet[c][..len];
            wet.copy_from_slice(&block[c][start..end]);
            self.filters[c].process_block(wet);
        }

        // One drive ramp shared by every channel.
        for i in 0..len {
            let g = self.drive.next();
            for wet in self.wet[..channels].iter_mut() {
                wet[i] = (wet[i] * g).tanh();
            }
        }

        let mix = self.params.mix;
        for c in 0..channels {
            let dry = &mut block[c][start..end];
            for (d, w) in dry.iter_mut().zip(&self.wet[c][..len]) {
                *d += w * mix;
            }
        }
    }

    fn update_filters(&mut self) {
        if !self.prepared {
            return;
        }
        for f in &mut self.filters {
            f.set_coefficients(
                FilterKind::HighPass,
                self.params.frequency,
                HPF_Q,
                1.0,
                self.sample_rate,
            );
        }
    }
}
