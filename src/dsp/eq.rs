//! Three-Band Equalizer
//!
//! Low shelf, mid peak and high shelf in series, one independent filter triple
//! per channel.
//!
//! # Lifecycle
//! - **Unprepared**: `process` is a no-op.
//! - **Active**: bands filter in place.
//! - **Bypassed**: audio passes through untouched.

use serde::{Deserialize, Serialize};

use crate::dsp::biquad::{FilterKind, FilterStage};
use crate::dsp::utils::{db_to_gain, sanitize};
use crate::dsp::{block_len, ProcessSpec};

// Band ranges. The three bands overlap so any target in 20 Hz..20 kHz is reachable.
const LOW_FREQ_RANGE: (f32, f32) = (20.0, 1000.0);
const MID_FREQ_RANGE: (f32, f32) = (200.0, 8000.0);
const HIGH_FREQ_RANGE: (f32, f32) = (1000.0, 20_000.0);
const GAIN_RANGE_DB: f32 = 24.0;
const Q_RANGE: (f32, f32) = (0.1, 10.0);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EqParams {
    pub low_freq: f32,
    pub mid_freq: f32,
    pub high_freq: f32,
    pub low_gain: f32,
    pub mid_gain: f32,
    pub high_gain: f32,
    pub low_q: f32,
    pub mid_q: f32,
    pub high_q: f32,
}

impl Default for EqParams {
    fn default() -> Self {
        Self {
            low_freq: 100.0,
            mid_freq: 1000.0,
            high_freq: 10_000.0,
            low_gain: 0.0,
            mid_gain: 0.0,
            high_gain: 0.0,
            low_q: 0.707,
            mid_q: 0.707,
            high_q: 0.707,
        }
    }
}

impl EqParams {
    /// Clamp every field into its documented range.
    pub fn clamped(self) -> Self {
        let d = Self::default();
        let gain = |v: f32, f: f32| sanitize(v, f, -GAIN_RANGE_DB, GAIN_RANGE_DB);
        let q = |v: f32, f: f32| sanitize(v, f, Q_RANGE.0, Q_RANGE.1);
        Self {
            low_freq: sanitize(self.low_freq, d.low_freq, LOW_FREQ_RANGE.0, LOW_FREQ_RANGE.1),
            mid_freq: sanitize(self.mid_freq, d.mid_freq, MID_FREQ_RANGE.0, MID_FREQ_RANGE.1),
            high_freq: sanitize(
                self.high_freq,
                d.high_freq,
                HIGH_FREQ_RANGE.0,
                HIGH_FREQ_RANGE.1,
            ),
            low_gain: gain(self.low_gain, d.low_gain),
            mid_gain: gain(self.mid_gain, d.mid_gain),
            high_gain: gain(self.high_gain, d.high_gain),
            low_q: q(self.low_q, d.low_q),
            mid_q: q(self.mid_q, d.mid_q),
            high_q: q(self.high_q, d.high_q),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BandTriple {
    low: FilterStage,
    mid: FilterStage,
    high: FilterStage,
}

impl BandTriple {
    #[inline]
    fn process(&mut self, x: f32) -> f32 {
        self.high.process_sample(self.mid.process_sample(self.low.process_sample(x)))
    }

    fn reset(&mut self) {
        self.low.reset();
        self.mid.reset();
        self.high.reset();
    }
}

pub struct EqProcessor {
    params: EqParams,
    bypassed: bool,
    sample_rate: f32,
    prepared: bool,
    bands: Vec<BandTriple>,
}

impl Default for EqProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl EqProcessor {
    pub fn new() -> Self {
        Self {
            params: EqParams::default(),
            bypassed: false,
            sample_rate: 0.0,
            prepared: false,
            bands: Vec::new(),
        }
    }

    pub fn prepare(&mut self, spec: &ProcessSpec) {
        if !spec.is_valid() {
            self.prepared = false;
            return;
        }
        self.sample_rate = spec.sample_rate as f32;
        self.bands = vec![BandTriple::default(); spec.channel_count];
        self.prepared = true;
        self.update_filters();
    }

    pub fn reset(&mut self) {
        for triple in &mut self.bands {
            triple.reset();
        }
    }

    /// Store all nine values and recompute every band.
    pub fn set_params(&mut self, params: EqParams) {
        self.params = params.clamped();
        self.update_filters();
    }

    pub fn params(&self) -> EqParams {
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
        for (ch, triple) in block.iter_mut().zip(self.bands.iter_mut()) {
            for s in ch[..n].iter_mut() {
                *s = triple.process(*s);
            }
        }
    }

    /// Combined magnitude of the three bands at `freq` (dB).
    pub fn response_db(&self, freq: f32) -> f32 {
        match self.bands.first() {
            Some(t) => {
                t.low.magnitude_db(freq, self.sample_rate)
                    + t.mid.magnitude_db(freq, self.sample_rate)
                    + t.high.magnitude_db(freq, self.sample_rate)
            }
            None => 0.0,
        }
    }

    fn update_filters(&mut self) {
        if !self.prepared {
            return;
        }
        let p = self.params;
        let sr = self.sample_rate;
        for t in &mut self.bands {
            t.low
                .set_coefficients(FilterKind::LowShelf, p.low_freq, p.low_q, db_to_gain(p.low_gain), sr);
            t.mid
                .set_coefficients(FilterKind::Peak, p.mid_freq, p.mid_q, db_to_gain(p.mid_gain), sr);
            t.high.set_coefficients(
                FilterKind::HighShelf,
                p.high_freq,
                p.high_q,
                db_to_gain(p.high_gain),
                sr,
            );
        }
    }
}
