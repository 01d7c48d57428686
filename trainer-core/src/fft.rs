//! # Fast Fourier Transform (FFT) Module
//!
//! FFT-based autocorrelation for the pitch estimator. Computing the lag
//! products through the frequency domain turns the O(N²) sum into two
//! transforms of a zero-padded buffer.
//!
//! ## Features
//! - High-performance FFT using RustFFT, plans built once per window size
//! - DC offset removal before analysis
//! - Linear (non-circular) autocorrelation via zero padding to ≥ 2N

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Removes the DC offset from a signal by making its average value zero.
///
/// # Arguments
/// * `signal` - Audio signal to process (modified in-place)
pub fn remove_dc_offset(signal: &mut [f32]) {
    let len = signal.len();
    if len == 0 {
        return;
    }
    let avg = signal.iter().sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Reusable autocorrelation engine for a fixed window size.
pub struct Autocorrelator {
    window_size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl Autocorrelator {
    pub fn new(window_size: usize) -> Self {
        let fft_len = (2 * window_size.max(1)).next_power_of_two();
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Self {
            window_size,
            forward,
            inverse,
            buffer: vec![Complex::new(0.0, 0.0); fft_len],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Computes `r(τ) = Σ x[j]·x[j+τ]` for τ in `0..window_size` into `out`.
    ///
    /// # Arguments
    /// * `signal` - Exactly `window_size` samples
    /// * `out` - Receives `window_size` lag values
    pub fn autocorrelate(&mut self, signal: &[f32], out: &mut [f32]) {
        let n = self.window_size;
        debug_assert_eq!(signal.len(), n);
        debug_assert_eq!(out.len(), n);

        for (slot, sample) in self.buffer.iter_mut().zip(signal.iter().chain(std::iter::repeat(&0.0f32))) {
            *slot = Complex::new(*sample, 0.0);
        }

        self.forward.process_with_scratch(&mut self.buffer, &mut self.scratch);
        for bin in self.buffer.iter_mut() {
            *bin = Complex::new(bin.norm_sqr(), 0.0);
        }
        self.inverse.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let scale = 1.0 / self.buffer.len() as f32;
        for (lag, value) in out.iter_mut().zip(self.buffer.iter()) {
            *lag = value.re * scale;
        }
    }
}
