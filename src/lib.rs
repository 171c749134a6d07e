pub mod chain;
pub mod debug;
pub mod dsp;
pub mod handoff;
pub mod presets;

use crate::chain::{ChainController, ChainIo, VocalChain};
use crate::presets::{ChainParams, FactoryPreset, PresetLibrary, MIC_COUNT};
use assert_no_alloc::permit_alloc;
use log::{info, warn};
use nih_plug::prelude::*;
use std::sync::{Arc, Mutex, RwLock};

// Snapshots and IR loads in flight between the control and audio threads.
const HANDOFF_CAPACITY: usize = 4;
// Blocks between garbage collection requests.
const HOUSEKEEPING_INTERVAL_BLOCKS: u32 = 64;

// -----------------------------------------------------------------------------
// PARAMETERS
// -----------------------------------------------------------------------------

#[derive(Params)]
pub struct StageVoxParams {
    /// The full chain document. Saved with the host project.
    #[persist = "chain-state"]
    pub chain_state: RwLock<ChainParams>,

    #[id = "vocal_level"]
    pub vocal_level: FloatParam,

    #[id = "backing_level"]
    pub backing_level: FloatParam,

    #[id = "factory_preset"]
    pub factory_preset: EnumParam<FactoryPreset>,
}

fn level_param(name: &'static str) -> FloatParam {
    FloatParam::new(
        name,
        util::db_to_gain(0.0),
        FloatRange::Skewed {
            min: util::db_to_gain(-60.0),
            max: util::db_to_gain(12.0),
            factor: FloatRange::gain_skew_factor(-60.0, 12.0),
        },
    )
    .with_smoother(SmoothingStyle::Logarithmic(50.0))
    .with_unit(" dB")
    .with_value_to_string(formatters::v2s_f32_gain_to_db(1))
    .with_string_to_value(formatters::s2v_f32_gain_to_db())
}

impl Default for StageVoxParams {
    fn default() -> Self {
        Self {
            chain_state: RwLock::new(ChainParams::default()),
            vocal_level: level_param("Vocal Level"),
            backing_level: level_param("Backing Level"),
            factory_preset: EnumParam::new("Preset", FactoryPreset::Manual).non_automatable(),
        }
    }
}

/// Work the audio thread hands to the background executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainTask {
    /// Replace the chain document with a factory preset.
    ApplyPreset(FactoryPreset),
    /// Free retired snapshots and impulse responses, flush the debug ring.
    CollectGarbage,
}

// -----------------------------------------------------------------------------
// PLUGIN STRUCT
// -----------------------------------------------------------------------------

struct StageVox {
    params: Arc<StageVoxParams>,
    chain: VocalChain,
    controller: Arc<Mutex<Option<ChainController>>>,
    library: Arc<PresetLibrary>,
    /// Host input copied out so the main buffer can receive the vocal bus.
    mic_scratch: [Vec<f32>; MIC_COUNT],
    last_preset: FactoryPreset,
    blocks_since_housekeeping: u32,
}

impl Default for StageVox {
    fn default() -> Self {
        Self {
            params: Arc::new(StageVoxParams::default()),
            chain: VocalChain::new(),
            controller: Arc::new(Mutex::new(None)),
            library: Arc::new(PresetLibrary::new()),
            mic_scratch: [Vec::new(), Vec::new()],
            last_preset: FactoryPreset::Manual,
            blocks_since_housekeeping: 0,
        }
    }
}

impl Plugin for StageVox {
    const NAME: &'static str = "StageVox";
    const VENDOR: &'static str = "StageVox";
    const URL: &'static str = "";
    const EMAIL: &'static str = "";
    const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    // Main input carries mic A (left) and mic B (right); the aux port is the
    // backing track. Output is the finished stereo mix.
    const AUDIO_IO_LAYOUTS: &'static [AudioIOLayout] = &[AudioIOLayout {
        main_input_channels: NonZeroU32::new(2),
        main_output_channels: NonZeroU32::new(2),
        aux_input_ports: &[new_nonzero_u32(2)],
        names: PortNames {
            layout: Some("Two Mics + Backing"),
            main_input: Some("Mics"),
            main_output: Some("Mix"),
            aux_inputs: &["Backing Track"],
            aux_outputs: &[],
        },
        ..AudioIOLayout::const_default()
    }];

    const MIDI_INPUT: MidiConfig = MidiConfig::None;
    const SAMPLE_ACCURATE_AUTOMATION: bool = true;

    type SysExMessage = ();
    type BackgroundTask = ChainTask;

    fn params(&self) -> Arc<dyn Params> {
        self.params.clone()
    }

    fn initialize(
        &mut self,
        _audio_io_layout: &AudioIOLayout,
        buffer_config: &BufferConfig,
        _context: &mut impl InitContext<Self>,
    ) -> bool {
        #[cfg(feature = "debug")]
        crate::debug::logger::init_logger();

        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let max_block = buffer_config.max_buffer_size as usize;
            let state = match self.params.chain_state.read() {
                Ok(state) => state.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };

            permit_alloc(|| {
                self.chain.set_params(state);
                self.chain
                    .prepare(f64::from(buffer_config.sample_rate), max_block);
                for ch in &mut self.mic_scratch {
                    *ch = vec![0.0; max_block];
                }
            });

            let controller = self.chain.attach_controller(HANDOFF_CAPACITY);
            match self.controller.lock() {
                Ok(mut slot) => *slot = Some(controller),
                Err(poisoned) => *poisoned.into_inner() = Some(controller),
            }

            self.last_preset = self.params.factory_preset.value();
            self.blocks_since_housekeeping = 0;
            info!(
                "initialized at {} Hz, max block {max_block}, reverb IR: {}",
                buffer_config.sample_rate,
                self.chain.ir_status().display_name()
            );
            true
        }))
        .unwrap_or(false)
    }

    fn task_executor(&mut self) -> TaskExecutor<Self> {
        let params = self.params.clone();
        let controller = self.controller.clone();
        let library = self.library.clone();
        Box::new(move |task| match task {
            ChainTask::ApplyPreset(preset) => {
                let Some(name) = preset.preset_name() else {
                    return;
                };
                let Some(chain_params) = library.get(name).cloned() else {
                    warn!("unknown factory preset {name}");
                    return;
                };
                if let Ok(mut state) = params.chain_state.write() {
                    *state = chain_params.clone();
                }
                if let Ok(mut slot) = controller.lock() {
                    if let Some(ctl) = slot.as_mut() {
                        match ctl.submit(chain_params) {
                            Ok(Some(status)) => {
                                info!("applied preset {name}, IR: {}", status.display_name())
                            }
                            Ok(None) => info!("applied preset {name}"),
                            Err(err) => warn!("{err:#}"),
                        }
                    }
                }
            }
            ChainTask::CollectGarbage => {
                if let Ok(mut slot) = controller.lock() {
                    if let Some(ctl) = slot.as_mut() {
                        ctl.collect_garbage();
                    }
                }
                crate::debug::drain();
            }
        })
    }

    fn process(
        &mut self,
        buffer: &mut Buffer,
        aux: &mut AuxiliaryBuffers,
        context: &mut impl ProcessContext<Self>,
    ) -> ProcessStatus {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.process_internal(buffer, aux, context)
        }))
        .unwrap_or(ProcessStatus::Normal)
    }

    fn reset(&mut self) {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.chain.reset();
        }))
        .unwrap_or(());
    }
}

impl StageVox {
    fn process_internal(
        &mut self,
        buffer: &mut Buffer,
        aux: &mut AuxiliaryBuffers,
        context: &mut impl ProcessContext<Self>,
    ) -> ProcessStatus {
        let preset = self.params.factory_preset.value();
        if preset != self.last_preset {
            self.last_preset = preset;
            if preset != FactoryPreset::Manual {
                context.execute_background(ChainTask::ApplyPreset(preset));
            }
        }

        self.blocks_since_housekeeping += 1;
        if self.blocks_since_housekeeping >= HOUSEKEEPING_INTERVAL_BLOCKS {
            self.blocks_since_housekeeping = 0;
            context.execute_background(ChainTask::CollectGarbage);
        }

        let frames = buffer.samples();
        let Some(backing) = aux.inputs.first_mut() else {
            return ProcessStatus::Normal;
        };
        let [backing_l, backing_r, ..] = backing.as_slice() else {
            return ProcessStatus::Normal;
        };
        let [out_l, out_r, ..] = buffer.as_slice() else {
            return ProcessStatus::Normal;
        };

        let chunk = self.mic_scratch[0].len();
        if chunk == 0 {
            return ProcessStatus::Normal;
        }

        let mut start = 0;
        while start < frames {
            let end = (start + chunk).min(frames);
            let len = end - start;

            for (scratch, input) in self.mic_scratch.iter_mut().zip([&**out_l, &**out_r]) {
                scratch[..len].copy_from_slice(&input[start..end]);
            }

            self.chain.process(ChainIo {
                mics: [&self.mic_scratch[0][..len], &self.mic_scratch[1][..len]],
                backing: [&mut backing_l[start..end], &mut backing_r[start..end]],
                vocals: [&mut out_l[start..end], &mut out_r[start..end]],
            });

            for i in start..end {
                let vocal_gain = self.params.vocal_level.smoothed.next();
                let backing_gain = self.params.backing_level.smoothed.next();
                out_l[i] = out_l[i] * vocal_gain + backing_l[i] * backing_gain;
                out_r[i] = out_r[i] * vocal_gain + backing_r[i] * backing_gain;
            }
            start = end;
        }

        ProcessStatus::Normal
    }
}

impl ClapPlugin for StageVox {
    const CLAP_ID: &'static str = "com.stagevox.live-vocal-chain";
    const CLAP_DESCRIPTION: Option<&'static str> =
        Some("Live vocal chain with harmonies, reverb and backing-track ducking");
    const CLAP_MANUAL_URL: Option<&'static str> = None;
    const CLAP_SUPPORT_URL: Option<&'static str> = None;
    const CLAP_FEATURES: &'static [ClapFeature] = &[
        ClapFeature::AudioEffect,
        ClapFeature::Stereo,
        ClapFeature::Reverb,
        ClapFeature::PitchShifter,
    ];
}

impl Vst3Plugin for StageVox {
    const VST3_CLASS_ID: [u8; 16] = *b"StageVoxLiveVox1";
    const VST3_SUBCATEGORIES: &'static [Vst3SubCategory] = &[
        Vst3SubCategory::Fx,
        Vst3SubCategory::Reverb,
        Vst3SubCategory::PitchShift,
    ];
}

nih_export_clap!(StageVox);
nih_export_vst3!(StageVox);
