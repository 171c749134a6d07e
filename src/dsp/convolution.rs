//! Partitioned FFT Convolution
//!
//! Uniformly partitioned overlap-save convolution with a frequency-domain delay
//! line. The impulse response is cut into `PARTITION_SIZE` blocks, each
//! transformed once at build time; at run time every completed input block costs
//! one forward FFT, one complex multiply-accumulate per partition and one inverse FFT.
//!
//! # Design Notes
//! - Latency is exactly one partition
//! - All memory is allocated by [`Convolver::new`]; processing never allocates
//! - Output channel `c` uses IR channel `min(c, ir_channels - 1)`
//! - A fresh convolver carries no history, so swapping in a new one is a clean restart

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::dsp::impulse::ImpulseResponse;

/// Partition length in samples (FFT size is twice this).
pub const PARTITION_SIZE: usize = 512;

/// Per output channel streaming state.
struct Lane {
    input: Vec<f32>,
    output: Vec<f32>,
    history: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    accum: Vec<Complex<f32>>,
    fdl: Vec<Vec<Complex<f32>>>,
    fdl_head: usize,
    fill: usize,
    kernel: usize,
}

impl Lane {
    fn new(partition: usize, partitions: usize, kernel: usize) -> Self {
        let n = partition * 2;
        Self {
            input: vec![0.0; partition],
            output: vec![0.0; partition],
            history: vec![0.0; n],
            spectrum: vec![Complex::default(); n],
            accum: vec![Complex::default(); n],
            fdl: vec![vec![Complex::default(); n]; partitions],
            fdl_head: 0,
            fill: 0,
            kernel,
        }
    }

    fn reset(&mut self) {
        self.input.fill(0.0);
        self.output.fill(0.0);
        self.history.fill(0.0);
        for slot in &mut self.fdl {
            slot.fill(Complex::default());
        }
        self.fdl_head = 0;
        self.fill = 0;
    }
}

pub struct Convolver {
    partition: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    /// [ir channel][partition][bin]
    kernels: Vec<Vec<Vec<Complex<f32>>>>,
    lanes: Vec<Lane>,
    scratch: Vec<Complex<f32>>,
    ir_len: usize,
}

impl Convolver {
    /// Partition `ir` (already at the running rate) for `channels` output channels.
    pub fn new(ir: &ImpulseResponse, channels: usize) -> Self {
        let partition = PARTITION_SIZE;
        let n = partition * 2;
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n);
        let ifft = planner.plan_fft_inverse(n);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());
        let mut scratch = vec![Complex::default(); scratch_len];

        let ir_len = ir.len();
        let partitions = ir_len.div_ceil(partition).max(1);
        let kernels: Vec<Vec<Vec<Complex<f32>>>> = (0..ir.num_channels())
            .map(|c| {
                let taps = ir.channel(c);
                (0..partitions)
                    .map(|p| {
                        let mut bins = vec![Complex::default(); n];
                        let start = (p * partition).min(taps.len());
                        let end = (start + partition).min(taps.len());
                        for (b, &t) in bins.iter_mut().zip(&taps[start..end]) {
                            *b = Complex::new(t, 0.0);
                        }
                        fft.process_with_scratch(&mut bins, &mut scratch);
                        bins
                    })
                    .collect()
            })
            .collect();

        let ir_channels = kernels.len().max(1);
        let lanes = (0..channels.max(1))
            .map(|c| Lane::new(partition, partitions, c.min(ir_channels - 1)))
            .collect();

        Self {
            partition,
            fft,
            ifft,
            kernels,
            lanes,
            scratch,
            ir_len,
        }
    }

    pub fn latency(&self) -> usize {
        self.partition
    }

    pub fn channels(&self) -> usize {
        self.lanes.len()
    }

    pub fn ir_len(&self) -> usize {
        self.ir_len
    }

    /// Clear all streaming history. Kernels are kept.
    pub fn reset(&mut self) {
        for lane in &mut self.lanes {
            lane.reset();
        }
    }

    /// Convolve one channel in place. Channels beyond the configured count are silenced.
    pub fn process_channel(&mut self, channel: usize, samples: &mut [f32]) {
        let Self {
            partition,
            fft,
            ifft,
            kernels,
            lanes,
            scratch,
            ..
        } = self;

        let Some(lane) = lanes.get_mut(channel) else {
            samples.fill(0.0);
            return;
        };
        let kernel = match kernels.get(lane.kernel) {
            Some(k) => k.as_slice(),
            None => {
                samples.fill(0.0);
                return;
            }
        };

        for s in samples.iter_mut() {
            let out = lane.output[lane.fill];
            lane.input[lane.fill] = *s;
            lane.fill += 1;
            if lane.fill == *partition {
                run_partition(lane, kernel, &**fft, &**ifft, scratch, *partition);
                lane.fill = 0;
            }
            *s = out;
        }
    }
}

/// One overlap-save step: FFT the sliding window, push it on the delay line,
/// multiply-accumulate against every kernel partition and keep the valid half.
fn run_partition(
    lane: &mut Lane,
    kernel: &[Vec<Complex<f32>>],
    fft: &dyn Fft<f32>,
    ifft: &dyn Fft<f32>,
    scratch: &mut [Complex<f32>],
    partition: usize,
) {
    let n = partition * 2;

    lane.history.copy_within(partition.., 0);
    lane.history[partition..].copy_from_slice(&lane.input);
    for (c, &h) in lane.spectrum.iter_mut().zip(&lane.history) {
        *c = Complex::new(h, 0.0);
    }

    #[cfg(debug_assertions)]
    assert_no_alloc::assert_no_alloc(|| {
        fft.process_with_scratch(&mut lane.spectrum, scratch);
    });
    #[cfg(not(debug_assertions))]
    fft.process_with_scratch(&mut lane.spectrum, scratch);

    let slots = lane.fdl.len();
    lane.fdl_head = (lane.fdl_head + slots - 1) % slots;
    lane.fdl[lane.fdl_head].copy_from_slice(&lane.spectrum);

    lane.accum.fill(Complex::default());
    for (p, h) in kernel.iter().enumerate() {
        let x = &lane.fdl[(lane.fdl_head + p) % slots];
        for ((acc, &xv), &hv) in lane.accum.iter_mut().zip(x).zip(h) {
            *acc += xv * hv;
        }
    }

    #[cfg(debug_assertions)]
    assert_no_alloc::assert_no_alloc(|| {
        ifft.process_with_scratch(&mut lane.accum, scratch);
    });
    #[cfg(not(debug_assertions))]
    ifft.process_with_scratch(&mut lane.accum, scratch);

    let norm = 1.0 / n as f32;
    for (o, c) in lane.output.iter_mut().zip(&lane.accum[partition..]) {
        *o = c.re * norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse_at(index: usize, gain: f32) -> ImpulseResponse {
        let mut taps = vec![0.0; index + 1];
        taps[index] = gain;
        ImpulseResponse::from_channels(vec![taps], 48_000.0)
    }

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| ((i * 37) % 101) as f32 / 100.0 - 0.5).collect()
    }

    #[test]
    fn unit_impulse_delays_by_one_partition() {
        let mut conv = Convolver::new(&impulse_at(0, 1.0), 1);
        let input = ramp(4096);
        let mut out = input.clone();
        for chunk in out.chunks_mut(100) {
            conv.process_channel(0, chunk);
        }
        let lat = conv.latency();
        assert!(out[..lat].iter().all(|v| v.abs() < 1e-6));
        for i in lat..4096 {
            assert!((out[i] - input[i - lat]).abs() < 1e-4, "sample {i}");
        }
    }

    #[test]
    fn taps_beyond_first_partition_land_correctly() {
        let mut conv = Convolver::new(&impulse_at(700, 0.5), 2);
        let mut left = vec![0.0f32; 3000];
        left[10] = 1.0;
        let mut right = left.clone();
        conv.process_channel(0, &mut left);
        conv.process_channel(1, &mut right);
        let expected = 10 + 700 + PARTITION_SIZE;
        for (i, (&l, &r)) in left.iter().zip(&right).enumerate() {
            let want = if i == expected { 0.5 } else { 0.0 };
            assert!((l - want).abs() < 1e-4, "left {i}: {l}");
            assert!((r - want).abs() < 1e-4, "right {i}: {r}");
        }
    }

    #[test]
    fn silence_stays_exactly_silent() {
        let ir = ImpulseResponse::embedded();
        let mut conv = Convolver::new(&ir, 2);
        let mut buf = vec![0.0f32; 2048];
        conv.process_channel(0, &mut buf);
        conv.process_channel(1, &mut buf);
        assert!(buf.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn reset_drops_history() {
        let mut conv = Convolver::new(&impulse_at(100, 1.0), 1);
        let mut buf = vec![1.0f32; 600];
        conv.process_channel(0, &mut buf);
        conv.reset();
        let mut silent = vec![0.0f32; 2048];
        conv.process_channel(0, &mut silent);
        assert!(silent.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn unknown_channel_is_silenced() {
        let mut conv = Convolver::new(&impulse_at(0, 1.0), 1);
        let mut buf = vec![1.0f32; 64];
        conv.process_channel(3, &mut buf);
        assert!(buf.iter().all(|&v| v == 0.0));
    }
}
