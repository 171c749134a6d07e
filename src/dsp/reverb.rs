//! Convolution Reverb
//!
//! # Perceptual Contract
//! - **Intended Effect**: Place the voice in a room. The wet branch is the input
//!   convolved with an impulse response, band-limited by a low cut and a high cut,
//!   scaled by `wet_gain` and added on top of the dry signal.
//! - **Failure Modes**:
//!   - Muddy low end when the low cut sits at its 20 Hz floor on a boomy IR.
//! - **Will Not Do**:
//!   - Attenuate the dry signal. `wet_gain = 0` is an exact pass-through.
//!
//! # Lifecycle
//! - **Unprepared**: `process` is a no-op.
//! - **Bypassed**: Passes audio through. The tail is cut, not faded.
//!
//! # Latency
//! The wet branch trails the dry signal by one convolution partition
//! ([`PARTITION_SIZE`](crate::dsp::convolution::PARTITION_SIZE) samples,
//! about 10.7 ms at 48 kHz). The dry path is not delayed, so nothing is
//! reported to the host; the offset reads as a short pre-delay. [`ReverbProcessor::wet_latency_samples`] exposes it.
//!
//! # Impulse responses
//! `set_params` with a new `ir_file_path` reloads synchronously (file I/O and
//! resampling; not real-time safe). Real-time hosts instead call
//! [`ReverbProcessor::attach_loader`] once and feed paths through the returned
//! [`IrLoader`]; the finished engine is swapped in at the next block boundary and
//! the old one travels back to the loader to be freed.

use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::dsp::biquad::{FilterKind, FilterStage};
use crate::dsp::convolution::Convolver;
use crate::dsp::impulse::{load_or_default, ImpulseResponse, IrStatus};
use crate::dsp::utils::sanitize;
use crate::dsp::{block_len, ProcessSpec};
use crate::handoff::{handoff, Handoff, HandoffReceiver};

const WET_RANGE: (f32, f32) = (0.0, 2.0);
const LOW_CUT_RANGE_HZ: (f32, f32) = (20.0, 1000.0);
const HIGH_CUT_RANGE_HZ: (f32, f32) = (1000.0, 20_000.0);
// Butterworth
const CUT_Q: f32 = 0.707;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReverbParams {
    /// Linear gain on the wet branch (0..2).
    pub wet_gain: f32,
    /// High-pass on the wet branch (Hz).
    pub low_cut_hz: f32,
    /// Low-pass on the wet branch (Hz).
    pub high_cut_hz: f32,
    /// WAV file to convolve with. Empty selects the built-in hall.
    pub ir_file_path: String,
}

impl Default for ReverbParams {
    fn default() -> Self {
        Self {
            wet_gain: 0.5,
            low_cut_hz: 20.0,
            high_cut_hz: 20_000.0,
            ir_file_path: String::new(),
        }
    }
}

impl ReverbParams {
    pub fn clamped(self) -> Self {
        let (wet_gain, low_cut_hz, high_cut_hz) = self.clamped_tone();
        Self {
            wet_gain,
            low_cut_hz,
            high_cut_hz,
            ir_file_path: self.ir_file_path,
        }
    }

    /// `(wet_gain, low_cut_hz, high_cut_hz)` in range. Leaves the path alone.
    fn clamped_tone(&self) -> (f32, f32, f32) {
        let d = Self::default();
        (
            sanitize(self.wet_gain, d.wet_gain, WET_RANGE.0, WET_RANGE.1),
            sanitize(
                self.low_cut_hz,
                d.low_cut_hz,
                LOW_CUT_RANGE_HZ.0,
                LOW_CUT_RANGE_HZ.1,
            ),
            sanitize(
                self.high_cut_hz,
                d.high_cut_hz,
                HIGH_CUT_RANGE_HZ.0,
                HIGH_CUT_RANGE_HZ.1,
            ),
        )
    }
}

/// An impulse response decoded and partitioned for one processing format.
pub struct LoadedIr {
    spec: ProcessSpec,
    source: Arc<ImpulseResponse>,
    convolver: Option<Convolver>,
    path: String,
    status: IrStatus,
}

impl LoadedIr {
    /// Resolve `path` (falling back to the built-in hall) and build its engine for `spec`.
    pub fn build(path: &str, spec: &ProcessSpec) -> Self {
        let (source, status) = load_or_default(path);
        let convolver = build_convolver(&source, spec);
        Self {
            spec: *spec,
            source,
            convolver,
            path: path.to_owned(),
            status,
        }
    }

    pub fn status(&self) -> &IrStatus {
        &self.status
    }
}

fn build_convolver(source: &ImpulseResponse, spec: &ProcessSpec) -> Option<Convolver> {
    if !spec.is_valid() {
        return None;
    }
    let ir = source.resampled(spec.sample_rate);
    Some(Convolver::new(&ir, spec.channel_count))
}

/// Control-side half of the asynchronous IR handoff.
pub struct IrLoader {
    tx: Handoff<Box<LoadedIr>>,
}

impl IrLoader {
    /// Decode, resample and partition `path` for `spec`, then queue it for the
    /// audio thread. Blocks on file I/O. Returns the status the reverb will report
    /// once the engine is picked up.
    pub fn load(&mut self, path: &str, spec: &ProcessSpec) -> IrStatus {
        let loaded = Box::new(LoadedIr::build(path, spec));
        let status = loaded.status.clone();
        if let Err(dropped) = self.tx.send(loaded) {
            warn!(
                "reverb IR queue full, dropping {}",
                dropped.status.display_name()
            );
        }
        status
    }

    /// Free engines the audio thread has replaced.
    pub fn collect_garbage(&mut self) -> usize {
        self.tx.collect_garbage()
    }

    pub fn pending(&self) -> usize {
        self.tx.pending()
    }
}

pub struct ReverbProcessor {
    params: ReverbParams,
    bypassed: bool,
    prepared: bool,
    spec: Option<ProcessSpec>,
    source: Arc<ImpulseResponse>,
    status: IrStatus,
    convolver: Option<Convolver>,
    low_cut: Vec<FilterStage>,
    high_cut: Vec<FilterStage>,
    dry: Vec<Vec<f32>>,
    incoming: Option<HandoffReceiver<Box<LoadedIr>>>,
}

impl Default for ReverbProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverbProcessor {
    pub fn new() -> Self {
        Self {
            params: ReverbParams::default(),
            bypassed: false,
            prepared: false,
            spec: None,
            source: ImpulseResponse::embedded(),
            status: IrStatus::Embedded,
            convolver: None,
            low_cut: Vec::new(),
            high_cut: Vec::new(),
            dry: Vec::new(),
            incoming: None,
        }
    }

    /// Allocates every buffer and builds the engine for the current IR.
    pub fn prepare(&mut self, spec: &ProcessSpec) {
        if !spec.is_valid() {
            self.prepared = false;
            return;
        }
        self.spec = Some(*spec);
        self.convolver = build_convolver(&self.source, spec);
        self.low_cut = vec![FilterStage::new(); spec.channel_count];
        self.high_cut = vec![FilterStage::new(); spec.channel_count];
        self.dry = vec![vec![0.0; spec.maximum_block_size]; spec.channel_count];
        self.prepared = true;
        self.update_filters();
    }

    pub fn reset(&mut self) {
        if let Some(conv) = &mut self.convolver {
            conv.reset();
        }
        for f in self.low_cut.iter_mut().chain(self.high_cut.iter_mut()) {
            f.reset();
        }
    }

    /// Apply all parameters. A changed IR path is loaded here, on the calling thread.
    pub fn set_params(&mut self, params: ReverbParams) {
        let params = params.clamped();
        let path_changed = params.ir_file_path != self.params.ir_file_path;
        self.set_tone(&params);
        if path_changed {
            let (source, status) = load_or_default(&params.ir_file_path);
            self.source = source;
            self.status = status;
            if let Some(spec) = self.spec {
                self.convolver = build_convolver(&self.source, &spec);
            }
        }
        self.params.ir_file_path = params.ir_file_path;
    }

    /// Apply wet gain and cut filters only. Real-time safe.
    pub fn set_tone(&mut self, params: &ReverbParams) {
        let (wet_gain, low_cut_hz, high_cut_hz) = params.clamped_tone();
        self.params.wet_gain = wet_gain;
        self.params.low_cut_hz = low_cut_hz;
        self.params.high_cut_hz = high_cut_hz;
        self.update_filters();
    }

    pub fn params(&self) -> ReverbParams {
        self.params.clone()
    }

    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// Samples by which the wet branch trails the dry signal. Zero until prepared.
    pub fn wet_latency_samples(&self) -> usize {
        self.convolver.as_ref().map_or(0, Convolver::latency)
    }

    pub fn ir_status(&self) -> &IrStatus {
        &self.status
    }

    /// Name of the active impulse response, e.g. "Default (Internal)".
    pub fn ir_name(&self) -> &str {
        self.status.display_name()
    }

    /// Open the asynchronous IR path. Any earlier loader is disconnected.
    pub fn attach_loader(&mut self, capacity: usize) -> IrLoader {
        let (tx, rx) = handoff(capacity);
        self.incoming = Some(rx);
        IrLoader { tx }
    }

    pub fn process(&mut self, block: &mut [&mut [f32]]) {
        self.receive_ir();
        if !self.prepared || self.bypassed {
            return;
        }
        let n = block_len(block);
        let chunk = self.dry.first().map_or(0, Vec::len);
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

    /// Swap in the newest engine from the loader, if it matches the running format.
    fn receive_ir(&mut self) {
        let Some(rx) = self.incoming.as_mut() else {
            return;
        };
        let Some(mut loaded) = rx.poll_latest() else {
            return;
        };
        if !self.prepared || self.spec != Some(loaded.spec) {
            crate::sv_log!(
                "reverb: dropped IR built for {} Hz / {} ch",
                loaded.spec.sample_rate,
                loaded.spec.channel_count
            );
            rx.retire(loaded);
            return;
        }
        std::mem::swap(&mut self.convolver, &mut loaded.convolver);
        std::mem::swap(&mut self.source, &mut loaded.source);
        std::mem::swap(&mut self.status, &mut loaded.status);
        std::mem::swap(&mut self.params.ir_file_path, &mut loaded.path);
        rx.retire(loaded);
    }

    fn process_chunk(&mut self, block: &mut [&mut [f32]], start: usize, end: usize) {
        let len = end - start;
        let channels = block.len().min(self.dry.len());
        let wet_gain = self.params.wet_gain;

        for c in 0..channels {
            let dry = &mut self.dry[c][..len];
            let io = &mut block[c][start..end];
            dry.copy_from_slice(io);

            match &mut self.convolver {
                Some(conv) => conv.process_channel(c, io),
                None => io.fill(0.0),
            }
            self.low_cut[c].process_block(io);
            self.high_cut[c].process_block(io);

            for (o, &d) in io.iter_mut().zip(dry.iter()) {
                *o = d + *o * wet_gain;
            }
        }
    }

    fn update_filters(&mut self) {
        let Some(spec) = self.spec else {
            return;
        };
        let sr = spec.sample_rate as f32;
        for f in &mut self.low_cut {
            f.set_coefficients(FilterKind::HighPass, self.params.low_cut_hz, CUT_Q, 1.0, sr);
        }
        for f in &mut self.high_cut {
            f.set_coefficients(FilterKind::LowPass, self.params.high_cut_hz, CUT_Q, 1.0, sr);
        }
    }
}
