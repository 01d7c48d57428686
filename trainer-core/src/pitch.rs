//! # Pitch Detection Module
//!
//! Fundamental-frequency estimation for the singing voice using the McLeod
//! Pitch Method: a normalized square difference function (NSDF) computed
//! from an FFT autocorrelation, key-maximum picking, and parabolic
//! interpolation of the chosen peak.
//!
//! ## Features
//! - Clarity score in 0..=1 alongside every candidate frequency
//! - Octave error prevention by taking the first strong key maximum
//! - Sub-sample accuracy through parabolic interpolation
//! - Allocation-free per frame after construction

use crate::fft::{self, Autocorrelator};

/// Fraction of the highest key maximum a peak must reach to be chosen.
const CUTOFF: f32 = 0.9;

/// Root-mean-square amplitude of a window.
pub fn rms(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    (signal.iter().map(|&s| s * s).sum::<f32>() / signal.len() as f32).sqrt()
}

/// One raw estimate: `frequency` in Hz (0 when none) and its clarity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PitchCandidate {
    pub frequency: f32,
    pub clarity: f32,
}

/// McLeod pitch detector for a fixed window size.
pub struct McLeodDetector {
    autocorrelator: Autocorrelator,
    signal: Vec<f32>,
    acf: Vec<f32>,
    nsdf: Vec<f32>,
    maxima: Vec<usize>,
}

impl McLeodDetector {
    pub fn new(window_size: usize) -> Self {
        Self {
            autocorrelator: Autocorrelator::new(window_size),
            signal: vec![0.0; window_size],
            acf: vec![0.0; window_size],
            nsdf: vec![0.0; window_size / 2],
            maxima: Vec::new(),
        }
    }

    pub fn window_size(&self) -> usize {
        self.signal.len()
    }

    /// Estimates the fundamental of `signal`.
    ///
    /// # Arguments
    /// * `signal` - Exactly `window_size` samples
    /// * `sample_rate` - Sample rate in Hz
    ///
    /// # Returns
    /// * `PitchCandidate` - Zero frequency and clarity when the window has no
    ///   periodic structure (silence included)
    pub fn find_pitch(&mut self, signal: &[f32], sample_rate: u32) -> PitchCandidate {
        if signal.len() != self.signal.len() || self.nsdf.len() < 3 {
            return PitchCandidate::default();
        }

        self.signal.copy_from_slice(signal);
        fft::remove_dc_offset(&mut self.signal);
        self.autocorrelator.autocorrelate(&self.signal, &mut self.acf);
        self.normalized_square_difference();
        self.find_key_maxima();

        let Some(highest) = self
            .maxima
            .iter()
            .map(|&i| self.nsdf[i])
            .max_by(f32::total_cmp)
        else {
            return PitchCandidate::default();
        };

        let cutoff = highest * CUTOFF;
        let Some(&chosen) = self.maxima.iter().find(|&&i| self.nsdf[i] >= cutoff) else {
            return PitchCandidate::default();
        };

        let (lag, clarity) = self.refine(chosen);
        if lag <= 0.0 {
            return PitchCandidate::default();
        }

        PitchCandidate {
            frequency: sample_rate as f32 / lag,
            clarity: clarity.min(1.0),
        }
    }

    /// `n(τ) = 2·r(τ) / m(τ)` where `m(τ)` is the energy of both overlapping
    /// segments, updated incrementally from `m(0) = 2·r(0)`.
    fn normalized_square_difference(&mut self) {
        let n = self.signal.len();
        let mut m = 2.0 * self.acf[0];
        for tau in 0..self.nsdf.len() {
            if tau > 0 {
                let head = self.signal[tau - 1];
                let tail = self.signal[n - tau];
                m -= head * head + tail * tail;
            }
            self.nsdf[tau] = if m > 1e-9 { 2.0 * self.acf[tau] / m } else { 0.0 };
        }
    }

    /// Collects the highest point of every positive region that follows a
    /// positive-going zero crossing. The initial region around lag 0 is
    /// skipped.
    fn find_key_maxima(&mut self) {
        self.maxima.clear();
        let len = self.nsdf.len();

        let mut i = 1;
        while i < len && self.nsdf[i] > 0.0 {
            i += 1;
        }

        let mut current: Option<usize> = None;
        while i < len - 1 {
            let value = self.nsdf[i];
            if value > 0.0 {
                let is_peak = value >= self.nsdf[i - 1] && value > self.nsdf[i + 1];
                if is_peak && current.is_none_or(|c| value > self.nsdf[c]) {
                    current = Some(i);
                }
            } else if let Some(peak) = current.take() {
                self.maxima.push(peak);
            }
            i += 1;
        }

        if let Some(peak) = current {
            self.maxima.push(peak);
        }
    }

    /// Vertex of the parabola through the peak and its two neighbours.
    fn refine(&self, index: usize) -> (f32, f32) {
        let y0 = self.nsdf[index - 1];
        let y1 = self.nsdf[index];
        let y2 = self.nsdf[index + 1];

        let denominator = y0 - 2.0 * y1 + y2;
        if denominator.abs() < f32::EPSILON {
            return (index as f32, y1);
        }

        let shift = 0.5 * (y0 - y2) / denominator;
        let vertex = y1 - 0.25 * (y0 - y2) * shift;
        (index as f32 + shift, vertex)
    }
}
