//! Live analysis node fed from an audio callback

use parking_lot::Mutex;
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::Arc;

use crate::config::AnalysisConfig;

/// Most recent `fft_size` mono samples
struct SampleRing {
    samples: Vec<f32>,
    write_pos: usize,
}

impl SampleRing {
    fn push(&mut self, sample: f32) {
        self.samples[self.write_pos] = sample;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
    }

    /// Oldest to newest
    fn copy_into(&self, out: &mut [f32]) {
        let (newer, older) = self.samples.split_at(self.write_pos);
        out[..older.len()].copy_from_slice(older);
        out[older.len()..].copy_from_slice(newer);
    }
}

struct FftState {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
}

/// Analyser node owned by a capture or playback component.
///
/// The audio thread only copies samples in; transforms run on the querying
/// thread. Smoothing state lives here, so every frequency query advances it.
pub struct AnalyserTap {
    sample_rate: u32,
    fft_size: usize,
    smoothing: f32,
    ring: Mutex<SampleRing>,
    fft: Mutex<FftState>,
}

impl AnalyserTap {
    pub fn new(sample_rate: u32, config: &AnalysisConfig) -> Self {
        let fft_size = config.fft_size.max(2).next_power_of_two();
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);

        // Blackman window
        let window = (0..fft_size)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / fft_size as f32;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();

        let state = FftState {
            input: fft.make_input_vec(),
            spectrum: fft.make_output_vec(),
            scratch: fft.make_scratch_vec(),
            smoothed: vec![0.0; fft_size / 2],
            window,
            fft,
        };

        Self {
            sample_rate,
            fft_size,
            smoothing: config.smoothing.clamp(0.0, 0.999),
            ring: Mutex::new(SampleRing {
                samples: vec![0.0; fft_size],
                write_pos: 0,
            }),
            fft: Mutex::new(state),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of frequency bins returned by [`Self::frequency_db`]
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Append mono samples
    pub fn write(&self, samples: &[f32]) {
        let mut ring = self.ring.lock();
        for &sample in samples {
            ring.push(sample);
        }
    }

    /// Append interleaved samples, averaging channels
    pub fn write_interleaved(&self, samples: &[f32], channels: u16) {
        let channels = channels.max(1) as usize;
        if channels == 1 {
            return self.write(samples);
        }
        let mut ring = self.ring.lock();
        for frame in samples.chunks_exact(channels) {
            ring.push(frame.iter().sum::<f32>() / channels as f32);
        }
    }

    /// Most recent `fft_size` samples, oldest first
    pub fn time_domain(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.fft_size];
        self.ring.lock().copy_into(&mut out);
        out
    }

    /// Smoothed magnitude per bin in decibels, `bin_count()` long
    pub fn frequency_db(&self) -> Vec<f32> {
        let mut guard = self.fft.lock();
        let state = &mut *guard;

        self.ring.lock().copy_into(&mut state.input);
        for (sample, w) in state.input.iter_mut().zip(&state.window) {
            *sample *= w;
        }

        if state
            .fft
            .process_with_scratch(&mut state.input, &mut state.spectrum, &mut state.scratch)
            .is_err()
        {
            return vec![f32::NEG_INFINITY; self.bin_count()];
        }

        let scale = 1.0 / self.fft_size as f32;
        let tau = self.smoothing;
        state
            .smoothed
            .iter_mut()
            .zip(&state.spectrum)
            .map(|(prev, bin)| {
                let magnitude = bin.norm() * scale;
                *prev = tau * *prev + (1.0 - tau) * magnitude;
                if *prev > 0.0 {
                    20.0 * prev.log10()
                } else {
                    f32::NEG_INFINITY
                }
            })
            .collect()
    }

    /// Forget all samples and smoothing history
    pub fn reset(&self) {
        {
            let mut ring = self.ring.lock();
            ring.samples.fill(0.0);
            ring.write_pos = 0;
        }
        self.fft.lock().smoothed.fill(0.0);
    }
}

impl std::fmt::Debug for AnalyserTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyserTap")
            .field("sample_rate", &self.sample_rate)
            .field("fft_size", &self.fft_size)
            .finish()
    }
}
