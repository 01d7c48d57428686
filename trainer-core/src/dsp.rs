//! # Signal Building Blocks
//!
//! Per-sample generators and processors used by the instrument voices:
//! band-limited-enough oscillators, scheduled parameter automation with
//! linear and exponential ramps, an RBJ biquad filter and a decaying noise
//! burst for percussive onsets.
//!
//! All scheduling is expressed in seconds on the engine clock
//! (`frame / sample_rate`), so a voice renders identically no matter how the
//! output callback slices its buffers.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use std::sync::Arc;

/// Basic oscillator shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Sawtooth,
    Triangle,
}

/// Phase-accumulating oscillator.
#[derive(Debug, Clone)]
pub struct Oscillator {
    waveform: Waveform,
    phase: f64,
    sample_rate: f64,
}

impl Oscillator {
    pub fn new(waveform: Waveform, sample_rate: u32) -> Self {
        Self {
            waveform,
            phase: 0.0,
            sample_rate: sample_rate as f64,
        }
    }

    /// Produces the next sample at `frequency` Hz and advances the phase.
    pub fn next_sample(&mut self, frequency: f64) -> f32 {
        let value = match self.waveform {
            Waveform::Sine => (self.phase * TAU).sin(),
            Waveform::Sawtooth => 2.0 * self.phase - 1.0,
            Waveform::Triangle => 1.0 - 4.0 * (self.phase - 0.5).abs(),
        };

        self.phase += frequency / self.sample_rate;
        self.phase -= self.phase.floor();
        value as f32
    }
}

/// Converts a detune in cents to a frequency ratio.
pub fn cents_to_ratio(cents: f64) -> f64 {
    2.0_f64.powf(cents / 1200.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Segment {
    Set,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct AutomationEvent {
    time: f64,
    value: f32,
    segment: Segment,
}

/// A scheduled parameter curve.
///
/// Events are appended in time order. The value at `t` is taken from the
/// last event at or before `t`, unless the following event is a ramp, in
/// which case the value is interpolated towards it. Exponential ramps between
/// values of opposite sign (or touching zero) hold the earlier value.
#[derive(Debug, Clone)]
pub struct Automation {
    initial: f32,
    events: Vec<AutomationEvent>,
    cursor: usize,
}

impl Automation {
    pub fn new(initial: f32) -> Self {
        Self {
            initial,
            events: Vec::new(),
            cursor: 0,
        }
    }

    /// A parameter that never changes.
    pub fn constant(value: f32) -> Self {
        Self::new(value)
    }

    pub fn set_value_at(mut self, value: f32, time: f64) -> Self {
        self.push(time, value, Segment::Set);
        self
    }

    pub fn linear_ramp_to(mut self, value: f32, time: f64) -> Self {
        self.push(time, value, Segment::Linear);
        self
    }

    pub fn exponential_ramp_to(mut self, value: f32, time: f64) -> Self {
        self.push(time, value, Segment::Exponential);
        self
    }

    fn push(&mut self, time: f64, value: f32, segment: Segment) {
        let time = self
            .events
            .last()
            .map_or(time, |last| time.max(last.time));
        self.events.push(AutomationEvent {
            time,
            value,
            segment,
        });
    }

    /// Value of the curve at `time`. Queries are expected to be
    /// non-decreasing; an earlier time rewinds the internal cursor.
    pub fn value_at(&mut self, time: f64) -> f32 {
        if self.events.is_empty() {
            return self.initial;
        }

        if self.cursor > 0 && self.events[self.cursor - 1].time > time {
            self.cursor = 0;
        }
        while self.cursor < self.events.len() && self.events[self.cursor].time <= time {
            self.cursor += 1;
        }

        // `cursor` now indexes the first event strictly after `time`.
        let (start_time, start_value) = match self.cursor {
            0 => (0.0, self.initial),
            i => (self.events[i - 1].time, self.events[i - 1].value),
        };

        let Some(next) = self.events.get(self.cursor) else {
            return start_value;
        };

        let span = next.time - start_time;
        if span <= 0.0 {
            return next.value;
        }
        let progress = ((time - start_time) / span).clamp(0.0, 1.0);

        match next.segment {
            Segment::Set => start_value,
            Segment::Linear => {
                start_value + (next.value - start_value) * progress as f32
            }
            Segment::Exponential => {
                if start_value == 0.0 || next.value == 0.0 || start_value.signum() != next.value.signum() {
                    start_value
                } else {
                    let ratio = (next.value / start_value) as f64;
                    (start_value as f64 * ratio.powf(progress)) as f32
                }
            }
        }
    }
}

/// Filter response type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Lowpass,
    Highpass,
}

/// RBJ-cookbook biquad with a time-varying cutoff.
#[derive(Debug, Clone)]
pub struct Biquad {
    kind: FilterKind,
    q: f64,
    sample_rate: f64,
    cutoff: f64,
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    pub fn new(kind: FilterKind, cutoff: f64, q: f64, sample_rate: u32) -> Self {
        let mut filter = Self {
            kind,
            q: q.max(1e-3),
            sample_rate: sample_rate as f64,
            cutoff: -1.0,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        };
        filter.set_cutoff(cutoff);
        filter
    }

    /// Recomputes coefficients when the cutoff moves by more than a fraction
    /// of a hertz.
    pub fn set_cutoff(&mut self, cutoff: f64) {
        let nyquist = self.sample_rate / 2.0;
        let cutoff = cutoff.clamp(10.0, nyquist * 0.99);
        if (cutoff - self.cutoff).abs() < 0.5 {
            return;
        }
        self.cutoff = cutoff;

        let w0 = TAU * cutoff / self.sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * self.q);
        let a0 = 1.0 + alpha;

        let (b0, b1, b2) = match self.kind {
            FilterKind::Lowpass => ((1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0),
            FilterKind::Highpass => ((1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0),
        };

        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = -2.0 * cos / a0;
        self.a2 = (1.0 - alpha) / a0;
    }

    pub fn process(&mut self, input: f32) -> f32 {
        let x0 = input as f64;
        let y0 = self.b0 * x0 + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;

        self.x2 = self.x1;
        self.x1 = x0;
        self.y2 = self.y1;
        self.y1 = y0;
        y0 as f32
    }
}

/// Builds a burst of white noise that decays linearly to zero.
pub fn decaying_noise(sample_rate: u32, seconds: f64, seed: u64) -> Arc<[f32]> {
    let length = (sample_rate as f64 * seconds).floor().max(1.0) as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    (0..length)
        .map(|i| {
            let decay = 1.0 - i as f32 / length as f32;
            rng.gen_range(-1.0f32..1.0) * decay
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_starts_at_zero_and_peaks_at_quarter_period() {
        let mut osc = Oscillator::new(Waveform::Sine, 400);
        let samples: Vec<f32> = (0..4).map(|_| osc.next_sample(100.0)).collect();
        assert!(samples[0].abs() < 1e-6);
        assert!((samples[1] - 1.0).abs() < 1e-6);
        assert!(samples[3] + 1.0 < 1e-6);
    }

    #[test]
    fn saw_and_triangle_stay_in_range() {
        for waveform in [Waveform::Sawtooth, Waveform::Triangle] {
            let mut osc = Oscillator::new(waveform, 44100);
            for _ in 0..10_000 {
                let s = osc.next_sample(523.25);
                assert!((-1.0..=1.0).contains(&s), "{waveform:?} produced {s}");
            }
        }
    }

    #[test]
    fn linear_ramp_interpolates() {
        let mut env = Automation::new(0.0)
            .set_value_at(0.0, 1.0)
            .linear_ramp_to(1.0, 2.0);
        assert_eq!(env.value_at(0.5), 0.0);
        assert_eq!(env.value_at(1.0), 0.0);
        assert!((env.value_at(1.5) - 0.5).abs() < 1e-6);
        assert_eq!(env.value_at(2.0), 1.0);
        assert_eq!(env.value_at(9.0), 1.0);
    }

    #[test]
    fn exponential_ramp_is_geometric() {
        let mut env = Automation::new(1.0)
            .set_value_at(1.0, 0.0)
            .exponential_ramp_to(0.01, 1.0);
        assert!((env.value_at(0.5) - 0.1).abs() < 1e-5);
        assert!((env.value_at(1.0) - 0.01).abs() < 1e-7);
    }

    #[test]
    fn exponential_ramp_from_zero_holds() {
        let mut env = Automation::new(0.0)
            .set_value_at(0.0, 0.0)
            .exponential_ramp_to(1.0, 1.0);
        assert_eq!(env.value_at(0.5), 0.0);
    }

    #[test]
    fn set_value_steps_without_ramping() {
        let mut env = Automation::new(0.0)
            .set_value_at(0.4, 0.0)
            .set_value_at(0.35, 1.0)
            .linear_ramp_to(0.0, 2.0);
        assert!((env.value_at(0.99) - 0.4).abs() < 1e-6);
        assert!((env.value_at(1.0) - 0.35).abs() < 1e-6);
        assert!((env.value_at(1.5) - 0.175).abs() < 1e-6);
    }

    #[test]
    fn lowpass_attenuates_high_frequencies() {
        let sr = 44100;
        let energy = |freq: f64| {
            let mut filter = Biquad::new(FilterKind::Lowpass, 500.0, 0.707, sr);
            let mut osc = Oscillator::new(Waveform::Sine, sr);
            (0..sr)
                .map(|_| filter.process(osc.next_sample(freq)))
                .skip(1000)
                .map(|s| s * s)
                .sum::<f32>()
        };
        assert!(energy(100.0) > 10.0 * energy(5000.0));
    }

    #[test]
    fn noise_burst_decays() {
        let burst = decaying_noise(44100, 0.03, 7);
        assert_eq!(burst.len(), 1323);
        assert!(burst.iter().all(|s| s.abs() <= 1.0));
        let head: f32 = burst[..100].iter().map(|s| s.abs()).sum();
        let tail: f32 = burst[burst.len() - 100..].iter().map(|s| s.abs()).sum();
        assert!(head > tail);
    }
}
