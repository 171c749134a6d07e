//! The live vocal pipeline.
//!
//! ```text
//! mic A ─ preamp ─ Exciter ─ Sculpt ─ EQ ─ Compressor ─┐
//! mic B ─ preamp ─ Exciter ─ Sculpt ─ EQ ─ Compressor ─┴─ Σ ─ Harmonizer ─ Reverb ─ Delay ─┬─ vocals
//!                                 fx-bypassed strips ─────────────────────────────────────┘
//!                                                                                           │ sidechain
//! backing track ─────────────────────────────────────────────────── Dynamic EQ (ducker) ◄──┘
//! ```
//!
//! [`VocalChain`] lives on the audio thread. [`ChainController`] lives on the
//! control thread and is the only way to change the chain while it runs: it sends
//! whole [`ChainParams`] snapshots and pre-built impulse responses, both picked up
//! at the next block boundary.

use anyhow::anyhow;

use crate::dsp::utils::db_to_gain;
use crate::dsp::{
    CompressorProcessor, DelayProcessor, DynamicEqProcessor, EqProcessor, ExciterProcessor,
    HarmonizerProcessor, IrLoader, IrStatus, LinearRamp, ProcessSpec, ReverbProcessor,
    SculptProcessor,
};
use crate::handoff::{handoff, Handoff, HandoffReceiver};
use crate::presets::{ChainParams, MicParams, MIC_COUNT};

/// Internal bus width.
pub const BUS_CHANNELS: usize = 2;
// Preamp gain ramp (s).
const PREAMP_RAMP_SECONDS: f64 = 0.02;

/// Host buffers for one block. All slices are expected to share one length; the
/// shortest one wins.
pub struct ChainIo<'a> {
    /// Mono microphone inputs.
    pub mics: [&'a [f32]; MIC_COUNT],
    /// Backing track, ducked in place.
    pub backing: [&'a mut [f32]; BUS_CHANNELS],
    /// Processed vocal bus, overwritten.
    pub vocals: [&'a mut [f32]; BUS_CHANNELS],
}

impl ChainIo<'_> {
    fn len(&self) -> usize {
        self.mics
            .iter()
            .map(|m| m.len())
            .chain(self.backing.iter().map(|b| b.len()))
            .chain(self.vocals.iter().map(|v| v.len()))
            .min()
            .unwrap_or(0)
    }
}

/// One microphone: mono in, stereo out.
pub struct MicStrip {
    params: MicParams,
    preamp: LinearRamp,
    exciter: ExciterProcessor,
    sculpt: SculptProcessor,
    eq: EqProcessor,
    compressor: CompressorProcessor,
    scratch: [Vec<f32>; BUS_CHANNELS],
}

impl Default for MicStrip {
    fn default() -> Self {
        Self::new()
    }
}

impl MicStrip {
    pub fn new() -> Self {
        let params = MicParams::default();
        Self {
            params,
            preamp: LinearRamp::new(db_to_gain(params.preamp_db)),
            exciter: ExciterProcessor::new(),
            sculpt: SculptProcessor::new(),
            eq: EqProcessor::new(),
            compressor: CompressorProcessor::new(),
            scratch: [Vec::new(), Vec::new()],
        }
    }

    pub fn prepare(&mut self, spec: &ProcessSpec) {
        self.exciter.prepare(spec);
        self.sculpt.prepare(spec);
        self.eq.prepare(spec);
        self.compressor.prepare(spec);
        self.preamp.prepare(PREAMP_RAMP_SECONDS, spec.sample_rate);
        self.preamp.snap(db_to_gain(self.params.preamp_db));
        for ch in &mut self.scratch {
            *ch = vec![0.0; spec.maximum_block_size];
        }
    }

    pub fn reset(&mut self) {
        self.exciter.reset();
        self.sculpt.reset();
        self.eq.reset();
        self.compressor.reset();
        self.preamp.snap(self.preamp.target());
    }

    pub fn set_params(&mut self, params: MicParams) {
        let params = params.clamped();
        self.params = params;
        self.preamp.set_target(db_to_gain(params.preamp_db));
        self.exciter.set_params(params.exciter);
        self.exciter.set_bypassed(params.exciter_bypassed);
        self.sculpt.set_params(params.sculpt);
        self.sculpt.set_bypassed(params.sculpt_bypassed);
        self.eq.set_params(params.eq);
        self.eq.set_bypassed(params.eq_bypassed);
        self.compressor.set_params(params.compressor);
        self.compressor.set_bypassed(params.compressor_bypassed);
    }

    pub fn params(&self) -> MicParams {
        self.params
    }

    pub fn is_muted(&self) -> bool {
        self.params.mute
    }

    pub fn is_fx_bypassed(&self) -> bool {
        self.params.fx_bypass
    }

    /// Gain reduction of the strip's compressor (dB, <= 0).
    pub fn gain_reduction_db(&self) -> f32 {
        self.compressor.gain_reduction_db()
    }

    /// Run `mic` through the strip. The result is in the first `mic.len()`
    /// samples of each scratch channel.
    fn run(&mut self, mic: &[f32]) {
        let len = mic.len().min(self.scratch[0].len());
        let [left, right] = &mut self.scratch;
        let (left, right) = (&mut left[..len], &mut right[..len]);
        for ((l, r), &m) in left.iter_mut().zip(right.iter_mut()).zip(mic) {
            let s = m * self.preamp.next();
            *l = s;
            *r = s;
        }
        if self.params.fx_bypass {
            return;
        }
        let mut block: [&mut [f32]; BUS_CHANNELS] = [left, right];
        self.exciter.process(&mut block);
        self.sculpt.process(&mut block);
        self.eq.process(&mut block);
        self.compressor.process(&mut block);
    }

    fn output(&self, len: usize) -> [&[f32]; BUS_CHANNELS] {
        [&self.scratch[0][..len], &self.scratch[1][..len]]
    }
}

pub struct VocalChain {
    params: ChainParams,
    spec: Option<ProcessSpec>,
    strips: [MicStrip; MIC_COUNT],
    harmonizer: HarmonizerProcessor,
    reverb: ReverbProcessor,
    delay: DelayProcessor,
    dynamic_eq: DynamicEqProcessor,
    /// Sum of fx-bypassed strips, added after the bus effects.
    direct: [Vec<f32>; BUS_CHANNELS],
    incoming: Option<HandoffReceiver<Box<ChainParams>>>,
}

impl Default for VocalChain {
    fn default() -> Self {
        Self::new()
    }
}

impl VocalChain {
    pub fn new() -> Self {
        let mut chain = Self {
            params: ChainParams::default(),
            spec: None,
            strips: std::array::from_fn(|_| MicStrip::new()),
            harmonizer: HarmonizerProcessor::new(),
            reverb: ReverbProcessor::new(),
            delay: DelayProcessor::new(),
            dynamic_eq: DynamicEqProcessor::new(),
            direct: [Vec::new(), Vec::new()],
            incoming: None,
        };
        chain.apply_bypass_flags();
        chain
    }

    /// Allocate everything for `sample_rate` and blocks of up to `max_block` frames.
    pub fn prepare(&mut self, sample_rate: f64, max_block: usize) {
        let spec = ProcessSpec::new(sample_rate, max_block, BUS_CHANNELS);
        if !spec.is_valid() {
            self.spec = None;
            return;
        }
        for strip in &mut self.strips {
            strip.prepare(&spec);
        }
        self.harmonizer.prepare(&spec);
        self.reverb.prepare(&spec);
        self.delay.prepare(&spec);
        self.dynamic_eq.prepare(&spec);
        for ch in &mut self.direct {
            *ch = vec![0.0; max_block];
        }
        self.spec = Some(spec);
    }

    pub fn reset(&mut self) {
        for strip in &mut self.strips {
            strip.reset();
        }
        self.harmonizer.reset();
        self.reverb.reset();
        self.delay.reset();
        self.dynamic_eq.reset();
    }

    /// The format the bus processors run at, once prepared.
    pub fn spec(&self) -> Option<ProcessSpec> {
        self.spec
    }

    /// Apply a full snapshot on the calling thread. Loads a changed impulse
    /// response synchronously, so not for use while the audio thread owns the chain.
    pub fn set_params(&mut self, params: ChainParams) {
        let params = params.clamped();
        self.reverb.set_params(params.reverb.clone());
        self.params = params;
        self.apply_realtime_params();
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn strip(&self, index: usize) -> Option<&MicStrip> {
        self.strips.get(index)
    }

    pub fn ir_status(&self) -> &IrStatus {
        self.reverb.ir_status()
    }

    /// Gain currently applied to the backing track (linear).
    pub fn ducking_gain(&self) -> f32 {
        self.dynamic_eq.current_gain()
    }

    /// Connect a control-side controller. Call before handing the chain to the
    /// audio thread; an earlier controller stops being heard.
    pub fn attach_controller(&mut self, capacity: usize) -> ChainController {
        let (params_tx, params_rx) = handoff(capacity);
        self.incoming = Some(params_rx);
        ChainController {
            params_tx,
            ir: self.reverb.attach_loader(capacity),
            spec: self.spec,
            ir_path: self.params.reverb.ir_file_path.clone(),
        }
    }

    pub fn process(&mut self, io: ChainIo) {
        self.receive_params();
        let n = io.len();
        let ChainIo {
            mics,
            mut backing,
            mut vocals,
        } = io;

        let chunk = self.direct[0].len();
        if self.spec.is_none() || chunk == 0 {
            for ch in &mut vocals {
                ch.fill(0.0);
            }
            return;
        }

        let mut start = 0;
        while start < n {
            let end = (start + chunk).min(n);
            let [bl, br] = &mut backing;
            let [vl, vr] = &mut vocals;
            self.process_chunk(
                [&mics[0][start..end], &mics[1][start..end]],
                [&mut bl[start..end], &mut br[start..end]],
                [&mut vl[start..end], &mut vr[start..end]],
            );
            start = end;
        }
    }

    fn process_chunk(
        &mut self,
        mics: [&[f32]; MIC_COUNT],
        mut backing: [&mut [f32]; BUS_CHANNELS],
        mut vocals: [&mut [f32]; BUS_CHANNELS],
    ) {
        let len = vocals[0].len();
        for ch in vocals.iter_mut() {
            ch.fill(0.0);
        }
        for ch in &mut self.direct {
            ch[..len].fill(0.0);
        }

        for (strip, mic) in self.strips.iter_mut().zip(mics) {
            if strip.is_muted() {
                continue;
            }
            strip.run(mic);
            let dest = if strip.is_fx_bypassed() {
                let [dl, dr] = &mut self.direct;
                [&mut dl[..len], &mut dr[..len]]
            } else {
                let [vl, vr] = &mut vocals;
                [&mut **vl, &mut **vr]
            };
            for (d, s) in dest.into_iter().zip(strip.output(len)) {
                for (o, &x) in d.iter_mut().zip(s) {
                    *o += x;
                }
            }
        }

        self.harmonizer.process(&mut vocals);
        self.reverb.process(&mut vocals);
        self.delay.process(&mut vocals);

        for (v, d) in vocals.iter_mut().zip(&self.direct) {
            for (o, &x) in v.iter_mut().zip(&d[..len]) {
                *o += x;
            }
        }

        self.dynamic_eq.process(&mut backing, &vocals);
    }

    /// Take the newest snapshot from the controller, if any.
    fn receive_params(&mut self) {
        let Some(rx) = self.incoming.as_mut() else {
            return;
        };
        let Some(mut snapshot) = rx.poll_latest() else {
            return;
        };
        // The old snapshot goes back in the same box, so nothing is freed here.
        std::mem::swap(&mut self.params, &mut *snapshot);
        rx.retire(snapshot);
        self.apply_realtime_params();
    }

    /// Everything except the impulse response path.
    fn apply_realtime_params(&mut self) {
        for (strip, mic) in self.strips.iter_mut().zip(self.params.mics) {
            strip.set_params(mic);
        }
        self.harmonizer.set_params(self.params.harmonizer);
        self.dynamic_eq.set_params(self.params.dynamic_eq);
        self.reverb.set_tone(&self.params.reverb);
        self.delay.set_params(self.params.delay);
        self.apply_bypass_flags();
    }

    fn apply_bypass_flags(&mut self) {
        self.harmonizer.set_bypassed(self.params.harmonizer_bypassed);
        self.reverb.set_bypassed(self.params.reverb_bypassed);
        self.delay.set_bypassed(self.params.delay_bypassed);
        self.dynamic_eq.set_bypassed(self.params.dynamic_eq_bypassed);
    }
}

/// Control-thread handle for a running [`VocalChain`].
pub struct ChainController {
    params_tx: Handoff<Box<ChainParams>>,
    ir: IrLoader,
    spec: Option<ProcessSpec>,
    ir_path: String,
}

impl ChainController {
    /// Tell the controller the chain was re-prepared. Impulse responses are built
    /// for this format from now on.
    pub fn set_spec(&mut self, spec: Option<ProcessSpec>) {
        self.spec = spec;
    }

    /// Queue a snapshot for the audio thread. A new impulse response path is
    /// loaded here first, blocking on file I/O; its status is returned.
    pub fn submit(&mut self, params: ChainParams) -> anyhow::Result<Option<IrStatus>> {
        let params = params.clamped();
        let mut status = None;
        if params.reverb.ir_file_path != self.ir_path {
            if let Some(spec) = self.spec {
                status = Some(self.ir.load(&params.reverb.ir_file_path, &spec));
                self.ir_path.clone_from(&params.reverb.ir_file_path);
            }
        }
        self.params_tx
            .send(Box::new(params))
            .map_err(|_| anyhow!("chain parameter queue is full, snapshot dropped"))?;
        Ok(status)
    }

    /// Free snapshots and impulse responses the audio thread is done with.
    pub fn collect_garbage(&mut self) -> usize {
        self.params_tx.collect_garbage() + self.ir.collect_garbage()
    }

    pub fn pending(&self) -> usize {
        self.params_tx.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::test_util::{rms, sine, BLOCK, SR};

    struct Buffers {
        mics: [Vec<f32>; MIC_COUNT],
        backing: [Vec<f32>; BUS_CHANNELS],
        vocals: [Vec<f32>; BUS_CHANNELS],
    }

    impl Buffers {
        fn new(mic_a: Vec<f32>, mic_b: Vec<f32>, backing: Vec<f32>) -> Self {
            let len = backing.len();
            Self {
                mics: [mic_a, mic_b],
                backing: [backing.clone(), backing],
                vocals: [vec![0.0; len], vec![0.0; len]],
            }
        }

        /// Feed everything through `chain` in host blocks of `block` frames.
        fn run(&mut self, chain: &mut VocalChain, block: usize) {
            let len = self.vocals[0].len();
            let mut start = 0;
            while start < len {
                let end = (start + block).min(len);
                let [bl, br] = &mut self.backing;
                let [vl, vr] = &mut self.vocals;
                chain.process(ChainIo {
                    mics: [&self.mics[0][start..end], &self.mics[1][start..end]],
                    backing: [&mut bl[start..end], &mut br[start..end]],
                    vocals: [&mut vl[start..end], &mut vr[start..end]],
                });
                start = end;
            }
        }
    }

    fn quiet_params() -> ChainParams {
        let mut p = ChainParams::default();
        p.reverb_bypassed = true;
        p.harmonizer_bypassed = true;
        p
    }

    fn prepared(params: ChainParams) -> VocalChain {
        let mut chain = VocalChain::new();
        chain.set_params(params);
        chain.prepare(SR, BLOCK);
        chain
    }

    #[test]
    fn unprepared_chain_outputs_silence_and_leaves_backing() {
        let mic = sine(220.0, 0.5, 1024, SR);
        let backing = sine(110.0, 0.3, 1024, SR);
        let mut bufs = Buffers::new(mic.clone(), mic, backing.clone());
        bufs.vocals[0].fill(1.0);
        let mut chain = VocalChain::new();
        bufs.run(&mut chain, BLOCK);
        assert!(bufs.vocals.iter().flatten().all(|&v| v == 0.0));
        assert_eq!(bufs.backing[0], backing);
    }

    #[test]
    fn fx_bypassed_mic_passes_straight_to_both_sides() {
        let mut p = quiet_params();
        p.mics[0].fx_bypass = true;
        p.mics[1].mute = true;
        let mut chain = prepared(p);

        let mic = sine(440.0, 0.4, 2048, SR);
        let mut bufs = Buffers::new(mic.clone(), vec![0.0; 2048], vec![0.0; 2048]);
        bufs.run(&mut chain, BLOCK);
        assert_eq!(bufs.vocals[0], mic);
        assert_eq!(bufs.vocals[1], mic);
    }

    #[test]
    fn muted_mics_leave_backing_untouched() {
        let mut p = quiet_params();
        p.mics[0].mute = true;
        p.mics[1].mute = true;
        let mut chain = prepared(p);

        let backing = sine(110.0, 0.3, 4096, SR);
        let loud = sine(440.0, 0.9, 4096, SR);
        let mut bufs = Buffers::new(loud.clone(), loud, backing.clone());
        bufs.run(&mut chain, BLOCK);
        assert!(bufs.vocals.iter().flatten().all(|&v| v == 0.0));
        assert_eq!(bufs.backing[0], backing);
        assert_eq!(chain.ducking_gain(), 1.0);
    }

    #[test]
    fn singing_ducks_the_backing_track() {
        let mut chain = prepared(quiet_params());
        let len = 48_000;
        let backing = sine(110.0, 0.3, len, SR);
        let voice = sine(375.0, 0.5, len, SR);
        let mut bufs = Buffers::new(voice.clone(), voice, backing.clone());
        bufs.run(&mut chain, BLOCK);

        let tail = len / 2;
        assert!(rms(&bufs.backing[0][tail..]) < 0.8 * rms(&backing[tail..]));
        assert!(chain.ducking_gain() < 1.0);
        assert!(rms(&bufs.vocals[0][tail..]) > 0.1);
    }

    #[test]
    fn delay_echoes_the_vocal_bus() {
        let len = 9600;
        let mut burst = vec![0.0; len];
        burst[..480].copy_from_slice(&sine(440.0, 0.1, 480, SR));
        let mut p = quiet_params();
        p.mics[1].mute = true;
        p.delay.delay_ms = 100.0;

        let render = |p: ChainParams| {
            let mut chain = prepared(p);
            let mut bufs = Buffers::new(burst.clone(), vec![0.0; len], vec![0.0; len]);
            bufs.run(&mut chain, BLOCK);
            bufs.vocals[0].clone()
        };
        let dry = render(p.clone());
        p.delay_bypassed = false;
        let wet = render(p);

        assert_eq!(wet[..4800], dry[..4800]);
        assert!(rms(&wet[4800..5280]) > rms(&dry[4800..5280]) + 0.01);
    }

    #[test]
    fn long_host_blocks_are_chunked() {
        let mut p = quiet_params();
        p.mics[0].fx_bypass = true;
        p.mics[1].mute = true;
        let mut chain = prepared(p);

        let mic = sine(300.0, 0.25, 3 * BLOCK + 17, SR);
        let len = mic.len();
        let mut bufs = Buffers::new(mic.clone(), vec![0.0; len], vec![0.0; len]);
        bufs.run(&mut chain, len);
        assert_eq!(bufs.vocals[1], mic);
    }

    #[test]
    fn controller_snapshots_apply_at_block_boundary() {
        let mut p = quiet_params();
        p.mics[0].fx_bypass = true;
        p.mics[1].mute = true;
        let mut chain = prepared(p.clone());
        let mut ctl = chain.attach_controller(4);

        let mic = sine(440.0, 0.4, BLOCK, SR);
        let mut bufs = Buffers::new(mic.clone(), vec![0.0; BLOCK], vec![0.0; BLOCK]);
        bufs.run(&mut chain, BLOCK);
        assert_eq!(bufs.vocals[0], mic);

        let mut muted = p;
        muted.mics[0].mute = true;
        assert_eq!(ctl.submit(muted).unwrap(), None);
        assert_eq!(ctl.pending(), 1);
        assert!(!chain.params().mics[0].mute);

        bufs.run(&mut chain, BLOCK);
        assert!(chain.params().mics[0].mute);
        assert!(bufs.vocals[0].iter().all(|&v| v == 0.0));
        assert_eq!(ctl.collect_garbage(), 1);
    }

    #[test]
    fn controller_loads_impulse_responses_off_the_audio_thread() {
        let mut chain = prepared(quiet_params());
        let mut ctl = chain.attach_controller(2);

        let mut p = quiet_params();
        p.reverb.ir_file_path = "/no/such/room.wav".into();
        let status = ctl.submit(p).unwrap();
        assert_eq!(status, Some(IrStatus::NotFound));
        assert_eq!(chain.ir_status(), &IrStatus::Embedded);

        let mut bufs = Buffers::new(vec![0.0; BLOCK], vec![0.0; BLOCK], vec![0.0; BLOCK]);
        bufs.run(&mut chain, BLOCK);
        assert_eq!(chain.ir_status(), &IrStatus::NotFound);
        assert_eq!(chain.params().reverb.ir_file_path, "/no/such/room.wav");
        // old snapshot + old impulse response
        assert_eq!(ctl.collect_garbage(), 2);
    }

    #[test]
    fn full_chain_does_not_allocate_while_processing() {
        let mut p = ChainParams::default();
        p.harmonizer_bypassed = false;
        p.harmonizer.voices[0].enabled = true;
        p.delay_bypassed = false;
        p.mics[0].compressor.kind = crate::dsp::CompressorType::Opto;
        p.mics[0].exciter.mix = 0.5;
        p.mics[0].sculpt.drive = 0.5;
        p.mics[1].fx_bypass = true;
        let mut chain = prepared(p.clone());
        let mut ctl = chain.attach_controller(2);

        let len = 4 * BLOCK;
        let voice = sine(330.0, 0.5, len, SR);
        let mut bufs = Buffers::new(voice.clone(), voice, sine(110.0, 0.3, len, SR));

        p.mics[0].preamp_db = 6.0;
        ctl.submit(p).unwrap();
        assert_no_alloc::assert_no_alloc(|| bufs.run(&mut chain, BLOCK));
        assert!(rms(&bufs.vocals[0]) > 0.0);
    }
}
