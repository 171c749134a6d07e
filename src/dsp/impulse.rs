//! Impulse Responses
//!
//! Decoding, conditioning and the built-in fallback hall used by the reverb.
//!
//! # Design Notes
//! - WAV files are decoded through `hound` (8..32 bit integer and 32 bit float)
//! - Only the first two channels are kept; mono IRs feed every output channel
//! - Sources are normalized to unit energy on their loudest channel at load time
//! - Resampling to the running rate happens when the convolution kernel is built
//! - Nothing here is real-time safe. Call from the control thread only.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use hound::{SampleFormat, WavReader};
use log::{info, warn};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Longest IR accepted after resampling (seconds).
pub const MAX_IR_SECONDS: f64 = 6.0;
/// Most channels kept from a file.
pub const MAX_IR_CHANNELS: usize = 2;

// Built-in hall: rate, length, pre-delay.
const EMBEDDED_RATE: f64 = 48_000.0;
const EMBEDDED_SECONDS: f64 = 1.2;
const EMBEDDED_PREDELAY_SECONDS: f64 = 0.010;
// Early reflections (ms after pre-delay, relative level).
const EMBEDDED_REFLECTIONS: [(f64, f32); 4] = [(7.0, 0.55), (13.0, 0.4), (19.0, 0.3), (31.0, 0.22)];
const EMBEDDED_SEED: u64 = 0x5eed_4a11;

/// Where the reverb's current impulse response came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrStatus {
    /// No file requested.
    Embedded,
    /// Loaded from disk; carries the file stem.
    File(String),
    /// Requested file does not exist; the built-in hall is used.
    NotFound,
    /// Requested file exists but could not be decoded; the built-in hall is used.
    LoadFailed,
}

impl IrStatus {
    pub fn display_name(&self) -> &str {
        match self {
            IrStatus::Embedded => "Default (Internal)",
            IrStatus::File(stem) => stem,
            IrStatus::NotFound => "File Not Found (Default)",
            IrStatus::LoadFailed => "Load Failed (Default)",
        }
    }

    /// True when the requested file could not be used.
    pub fn is_fallback(&self) -> bool {
        matches!(self, IrStatus::NotFound | IrStatus::LoadFailed)
    }
}

/// Multi-channel impulse response at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpulseResponse {
    channels: Vec<Vec<f32>>,
    sample_rate: f64,
}

static EMBEDDED: Lazy<Arc<ImpulseResponse>> = Lazy::new(|| Arc::new(generate_hall()));

impl ImpulseResponse {
    /// Build from deinterleaved channels. Extra channels beyond two are dropped
    /// and ragged channels are zero-padded to the longest.
    pub fn from_channels(mut channels: Vec<Vec<f32>>, sample_rate: f64) -> Self {
        channels.truncate(MAX_IR_CHANNELS);
        if channels.is_empty() {
            channels.push(Vec::new());
        }
        let len = channels.iter().map(Vec::len).max().unwrap_or(0);
        for ch in &mut channels {
            ch.resize(len, 0.0);
        }
        Self {
            channels,
            sample_rate,
        }
    }

    /// The shared built-in hall.
    pub fn embedded() -> Arc<ImpulseResponse> {
        Arc::clone(&EMBEDDED)
    }

    pub fn from_wav_file(path: &Path) -> anyhow::Result<Self> {
        let reader = WavReader::open(path)
            .with_context(|| format!("failed to open impulse response {}", path.display()))?;
        let spec = reader.spec();
        let channel_count = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .context("corrupt float sample data")?,
            SampleFormat::Int => {
                if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                    bail!("unsupported bit depth {}", spec.bits_per_sample);
                }
                let scale = 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<_, _>>()
                    .context("corrupt integer sample data")?
            }
        };

        let frames = interleaved.len() / channel_count;
        if frames == 0 {
            bail!("impulse response {} contains no samples", path.display());
        }

        let kept = channel_count.min(MAX_IR_CHANNELS);
        let mut channels = vec![Vec::with_capacity(frames); kept];
        for frame in interleaved.chunks_exact(channel_count) {
            for (ch, &v) in channels.iter_mut().zip(frame) {
                ch.push(v);
            }
        }

        Ok(Self::from_channels(channels, f64::from(spec.sample_rate)).normalized())
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Samples of channel `index`, reusing the last channel for higher indices.
    pub fn channel(&self, index: usize) -> &[f32] {
        let i = index.min(self.channels.len().saturating_sub(1));
        self.channels.get(i).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Scale so the loudest channel has unit energy. Silent IRs are left alone.
    pub fn normalized(mut self) -> Self {
        let peak_energy = self
            .channels
            .iter()
            .map(|ch| ch.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>())
            .fold(0.0f64, f64::max);
        if peak_energy > 1e-12 {
            let gain = (1.0 / peak_energy.sqrt()) as f32;
            for ch in &mut self.channels {
                ch.iter_mut().for_each(|v| *v *= gain);
            }
        }
        self
    }

    /// Linear-interpolation resample to `target_rate`, capped at [`MAX_IR_SECONDS`].
    pub fn resampled(&self, target_rate: f64) -> ImpulseResponse {
        let max_len = (MAX_IR_SECONDS * target_rate) as usize;
        if (self.sample_rate - target_rate).abs() < 1e-6 || self.is_empty() {
            let channels = self
                .channels
                .iter()
                .map(|ch| ch[..ch.len().min(max_len)].to_vec())
                .collect();
            return ImpulseResponse {
                channels,
                sample_rate: target_rate,
            };
        }

        let ratio = self.sample_rate / target_rate;
        let out_len = ((self.len() as f64) / ratio).round().max(1.0) as usize;
        let out_len = out_len.min(max_len);
        let channels = self
            .channels
            .iter()
            .map(|ch| {
                (0..out_len)
                    .map(|i| {
                        let pos = i as f64 * ratio;
                        let i0 = pos.floor() as usize;
                        let frac = (pos - i0 as f64) as f32;
                        let a = ch.get(i0).copied().unwrap_or(0.0);
                        let b = ch.get(i0 + 1).copied().unwrap_or(0.0);
                        a + (b - a) * frac
                    })
                    .collect()
            })
            .collect();
        ImpulseResponse {
            channels,
            sample_rate: target_rate,
        }
    }
}

/// Resolve an IR path to a usable response, falling back to the built-in hall.
///
/// An empty path selects the built-in hall. Never fails.
pub fn load_or_default(path: &str) -> (Arc<ImpulseResponse>, IrStatus) {
    if path.is_empty() {
        return (ImpulseResponse::embedded(), IrStatus::Embedded);
    }
    let file = Path::new(path);
    if !file.is_file() {
        warn!("impulse response not found: {path}, using built-in hall");
        return (ImpulseResponse::embedded(), IrStatus::NotFound);
    }
    match ImpulseResponse::from_wav_file(file) {
        Ok(ir) => {
            let stem = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_owned());
            info!(
                "loaded impulse response {stem}: {} ch, {} samples @ {} Hz",
                ir.num_channels(),
                ir.len(),
                ir.sample_rate()
            );
            (Arc::new(ir), IrStatus::File(stem))
        }
        Err(err) => {
            warn!("{err:#}, using built-in hall");
            (ImpulseResponse::embedded(), IrStatus::LoadFailed)
        }
    }
}

/// Deterministic stereo hall: sparse early reflections into a darkening noise tail.
fn generate_hall() -> ImpulseResponse {
    let len = (EMBEDDED_SECONDS * EMBEDDED_RATE) as usize;
    let predelay = (EMBEDDED_PREDELAY_SECONDS * EMBEDDED_RATE) as usize;
    let tail_len = (len - predelay) as f32;
    let mut rng = StdRng::seed_from_u64(EMBEDDED_SEED);

    let mut channels = vec![vec![0.0f32; len]; 2];
    for (c, ch) in channels.iter_mut().enumerate() {
        let mut lp = 0.0f32;
        for (i, out) in ch.iter_mut().enumerate().skip(predelay) {
            let t = (i - predelay) as f32 / tail_len;
            // -60 dB across the tail
            let env = (-6.9 * t).exp();
            // one-pole low-pass closing over time
            let coeff = 0.6 - 0.45 * t;
            let noise: f32 = rng.gen_range(-1.0..1.0);
            lp += coeff * (noise - lp);
            *out = lp * env * 0.3;
        }
        for (k, &(ms, level)) in EMBEDDED_REFLECTIONS.iter().enumerate() {
            // mirror the pattern between channels for width
            let offset = if (k + c) % 2 == 0 { 0.0 } else { 1.7 };
            let idx = predelay + ((ms + offset) * 0.001 * EMBEDDED_RATE) as usize;
            if let Some(s) = ch.get_mut(idx) {
                *s += level;
            }
        }
    }
    ImpulseResponse::from_channels(channels, EMBEDDED_RATE).normalized()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &Path, channels: u16, rate: u32, frames: &[Vec<i16>]) {
        let spec = WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut w = WavWriter::create(path, spec).unwrap();
        for frame in frames {
            for &s in frame {
                w.write_sample(s).unwrap();
            }
        }
        w.finalize().unwrap();
    }

    #[test]
    fn embedded_hall_is_stereo_normalized_and_stable() {
        let a = ImpulseResponse::embedded();
        let b = ImpulseResponse::embedded();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.num_channels(), 2);
        assert_eq!(a.len(), 57_600);
        let energy: f32 = a.channel(0).iter().map(|v| v * v).sum();
        let energy_r: f32 = a.channel(1).iter().map(|v| v * v).sum();
        assert!((energy.max(energy_r) - 1.0).abs() < 1e-3);
        assert!(a.channel(0)[..480].iter().all(|&v| v == 0.0));
        assert_ne!(a.channel(0), a.channel(1));
    }

    #[test]
    fn decodes_stereo_int_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("room.wav");
        write_wav(&path, 2, 48_000, &[vec![16_384, 0], vec![0, -16_384], vec![0, 0]]);

        let ir = ImpulseResponse::from_wav_file(&path).unwrap();
        assert_eq!(ir.num_channels(), 2);
        assert_eq!(ir.len(), 3);
        // each channel has a single tap; normalization makes it unit
        assert!((ir.channel(0)[0] - 1.0).abs() < 1e-6);
        assert!((ir.channel(1)[1] + 1.0).abs() < 1e-6);
        assert_eq!(ir.channel(5), ir.channel(1));
    }

    #[test]
    fn missing_file_falls_back_with_named_status() {
        let (ir, status) = load_or_default("/definitely/not/here.wav");
        assert_eq!(status, IrStatus::NotFound);
        assert_eq!(status.display_name(), "File Not Found (Default)");
        assert!(Arc::ptr_eq(&ir, &ImpulseResponse::embedded()));
    }

    #[test]
    fn undecodable_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"not a riff file").unwrap();
        let (_, status) = load_or_default(path.to_str().unwrap());
        assert_eq!(status, IrStatus::LoadFailed);
        assert!(status.is_fallback());
    }

    #[test]
    fn loaded_file_reports_its_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Plate Medium.wav");
        write_wav(&path, 1, 44_100, &[vec![20_000], vec![10_000]]);
        let (ir, status) = load_or_default(path.to_str().unwrap());
        assert_eq!(status.display_name(), "Plate Medium");
        assert_eq!(ir.num_channels(), 1);
        assert_eq!(IrStatus::Embedded.display_name(), "Default (Internal)");
    }

    #[test]
    fn resampling_scales_length_and_caps_it() {
        let ir = ImpulseResponse::from_channels(vec![vec![1.0; 44_100]], 44_100.0);
        let up = ir.resampled(48_000.0);
        assert_eq!(up.len(), 48_000);
        assert_eq!(up.sample_rate(), 48_000.0);

        let long = ImpulseResponse::from_channels(vec![vec![0.1; 48_000 * 8]], 48_000.0);
        assert_eq!(long.resampled(48_000.0).len(), 48_000 * 6);
    }
}
