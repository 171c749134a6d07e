pub mod biquad;
pub mod compressor;
pub mod convolution;
pub mod delay;
pub mod dynamic_eq;
pub mod envelope;
pub mod eq;
pub mod exciter;
pub mod harmonizer;
pub mod impulse;
pub mod pitch_shifter;
pub mod reverb;
pub mod sculpt;
pub mod utils;

pub use biquad::{FilterKind, FilterStage};
pub use compressor::{CompressorParams, CompressorProcessor, CompressorType};
pub use convolution::Convolver;
pub use delay::{DelayParams, DelayProcessor};
pub use dynamic_eq::{DynamicEqParams, DynamicEqProcessor};
pub use envelope::{EnvelopeFollower, LinearRamp};
pub use eq::{EqParams, EqProcessor};
pub use exciter::{ExciterParams, ExciterProcessor};
pub use harmonizer::{HarmonizerParams, HarmonizerProcessor, VoiceParams, VOICE_COUNT};
pub use impulse::{ImpulseResponse, IrStatus};
pub use pitch_shifter::GranularPitchShifter;
pub use reverb::{IrLoader, ReverbParams, ReverbProcessor};
pub use sculpt::{SaturationMode, SculptParams, SculptProcessor};

/// Host format handshake handed to every processor's `prepare`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSpec {
    pub sample_rate: f64,
    pub maximum_block_size: usize,
    pub channel_count: usize,
}

impl ProcessSpec {
    pub fn new(sample_rate: f64, maximum_block_size: usize, channel_count: usize) -> Self {
        Self {
            sample_rate,
            maximum_block_size,
            channel_count,
        }
    }

    /// A spec the processors can actually run with.
    pub fn is_valid(&self) -> bool {
        self.sample_rate.is_finite()
            && self.sample_rate > 0.0
            && self.maximum_block_size > 0
            && self.channel_count > 0
    }
}

/// Length of the shortest channel, the number of frames a block call will touch.
#[inline]
pub(crate) fn block_len(block: &[&mut [f32]]) -> usize {
    block.iter().map(|ch| ch.len()).min().unwrap_or(0)
}
