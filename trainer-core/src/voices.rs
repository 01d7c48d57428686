//! # Instrument Voice Library
//!
//! Each instrument turns one [`VoiceRequest`] into a self-contained
//! [`Voice`]: a small signal graph (oscillator partials, optional vibrato,
//! optional tone filter, gain envelopes) scheduled at absolute times on the
//! engine clock. Voices are attached to a playback bus and rendered by the
//! mixer one sample at a time, so start and stop land on exact frames.

use crate::dsp::{self, Automation, Biquad, FilterKind, Oscillator, Waveform};
use crate::mixer::BusId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Piano notes ring out past their nominal duration by this factor.
pub const PIANO_DECAY_MULTIPLIER: f64 = 1.6;

const HAMMER_SECONDS: f64 = 0.03;
const HAMMER_SEED: u64 = 0x4a4d;

/// A sound source rendered sample by sample on the engine clock.
pub trait Voice: Send {
    /// Output for absolute engine frame `frame`. Frames are visited in
    /// increasing order.
    fn render(&mut self, frame: u64) -> f32;

    /// First frame at which the voice is permanently silent.
    fn end_frame(&self) -> u64;
}

/// The playback instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Instrument {
    Piano,
    Saxophone,
    Guitar,
    Flute,
    Violin,
    Voice,
}

impl Instrument {
    pub const ALL: [Instrument; 6] = [
        Instrument::Piano,
        Instrument::Saxophone,
        Instrument::Guitar,
        Instrument::Flute,
        Instrument::Violin,
        Instrument::Voice,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Instrument::Piano => "piano",
            Instrument::Saxophone => "saxophone",
            Instrument::Guitar => "guitar",
            Instrument::Flute => "flute",
            Instrument::Violin => "violin",
            Instrument::Voice => "voice",
        }
    }

    /// How long a note of nominal `duration` keeps sounding.
    pub fn tail(self, duration: f64) -> f64 {
        match self {
            Instrument::Piano => duration * PIANO_DECAY_MULTIPLIER,
            _ => duration,
        }
    }

    /// Builds the voice for one note.
    pub fn render(self, request: &VoiceRequest, library: &VoiceLibrary) -> Box<dyn Voice> {
        let voice = match self {
            Instrument::Piano => piano(request, library),
            Instrument::Saxophone => saxophone(request, library.sample_rate),
            Instrument::Guitar => guitar(request, library.sample_rate),
            Instrument::Flute => flute(request, library.sample_rate),
            Instrument::Violin => violin(request, library.sample_rate),
            Instrument::Voice => vocal(request, library.sample_rate),
        };
        Box::new(voice)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Instrument {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Instrument::ALL
            .into_iter()
            .find(|i| i.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown instrument `{s}`"))
    }
}

/// One note to render: frequency in Hz, duration and start in seconds on the
/// engine clock, and the bus the voice is attached to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceRequest {
    pub frequency: f64,
    pub duration: f64,
    pub start_time: f64,
    pub bus: BusId,
}

/// Per-output-device state shared by voices, such as the cached hammer noise.
#[derive(Debug, Clone)]
pub struct VoiceLibrary {
    sample_rate: u32,
    hammer: Arc<[f32]>,
}

impl VoiceLibrary {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            hammer: dsp::decaying_noise(sample_rate, HAMMER_SECONDS, HAMMER_SEED),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// The two-partial pure tone used as a starting-pitch cue.
    pub fn reference_tone(&self, request: &VoiceRequest) -> Box<dyn Voice> {
        let start = request.start_time;
        let end = start + request.duration;
        let fundamental = Automation::new(0.0)
            .set_value_at(0.0, start)
            .linear_ramp_to(0.32, start + 0.02)
            .exponential_ramp_to(0.001, end);
        let overtone = Automation::new(0.0)
            .set_value_at(0.0, start)
            .linear_ramp_to(0.08, start + 0.02)
            .exponential_ramp_to(0.0005, end);

        let voice = SynthVoice::new(request, self.sample_rate, end)
            .partial(Waveform::Sine, 1.0, 0.0, fundamental)
            .partial(Waveform::Sine, 2.0, 0.0, overtone);
        Box::new(voice)
    }
}

struct Partial {
    oscillator: Oscillator,
    multiple: f64,
    detune_ratio: f64,
    gain: Automation,
}

struct Vibrato {
    oscillator: Oscillator,
    rate: f64,
    depth_cents: f64,
}

struct ToneFilter {
    filter: Biquad,
    cutoff: Automation,
}

struct Transient {
    samples: Arc<[f32]>,
    start_frame: u64,
    highpass: Biquad,
    gain: Automation,
}

/// Additive/subtractive voice shared by all instruments.
///
/// Signal path: partials → `mix` gain (+ onset transient) → optional tone
/// filter → `output` gain.
struct SynthVoice {
    frequency: f64,
    sample_rate: f64,
    start_frame: u64,
    end_frame: u64,
    partials: Vec<Partial>,
    vibrato: Option<Vibrato>,
    mix: Automation,
    transient: Option<Transient>,
    tone_filter: Option<ToneFilter>,
    output: Automation,
}

impl SynthVoice {
    fn new(request: &VoiceRequest, sample_rate: u32, stop_time: f64) -> Self {
        let sr = sample_rate as f64;
        Self {
            frequency: request.frequency,
            sample_rate: sr,
            start_frame: seconds_to_frame(request.start_time, sr),
            end_frame: seconds_to_frame(stop_time, sr),
            partials: Vec::new(),
            vibrato: None,
            mix: Automation::constant(1.0),
            transient: None,
            tone_filter: None,
            output: Automation::constant(1.0),
        }
    }

    fn partial(mut self, waveform: Waveform, multiple: f64, detune_cents: f64, gain: Automation) -> Self {
        self.partials.push(Partial {
            oscillator: Oscillator::new(waveform, self.sample_rate as u32),
            multiple,
            detune_ratio: dsp::cents_to_ratio(detune_cents),
            gain,
        });
        self
    }

    fn vibrato(mut self, rate: f64, depth_cents: f64) -> Self {
        self.vibrato = Some(Vibrato {
            oscillator: Oscillator::new(Waveform::Sine, self.sample_rate as u32),
            rate,
            depth_cents,
        });
        self
    }

    fn mix(mut self, mix: Automation) -> Self {
        self.mix = mix;
        self
    }

    fn transient(mut self, transient: Transient) -> Self {
        self.transient = Some(transient);
        self
    }

    fn tone_filter(mut self, filter: Biquad, cutoff: Automation) -> Self {
        self.tone_filter = Some(ToneFilter { filter, cutoff });
        self
    }

    fn output(mut self, output: Automation) -> Self {
        self.output = output;
        self
    }
}

impl Voice for SynthVoice {
    fn render(&mut self, frame: u64) -> f32 {
        if frame < self.start_frame || frame >= self.end_frame {
            return 0.0;
        }
        let time = frame as f64 / self.sample_rate;

        let frequency = match self.vibrato.as_mut() {
            Some(vibrato) => {
                let lfo = vibrato.oscillator.next_sample(vibrato.rate) as f64;
                self.frequency * dsp::cents_to_ratio(lfo * vibrato.depth_cents)
            }
            None => self.frequency,
        };

        let mut signal = 0.0;
        for partial in &mut self.partials {
            let partial_frequency = frequency * partial.multiple * partial.detune_ratio;
            signal += partial.oscillator.next_sample(partial_frequency) * partial.gain.value_at(time);
        }
        signal *= self.mix.value_at(time);

        if let Some(transient) = self.transient.as_mut() {
            let offset = frame.saturating_sub(transient.start_frame) as usize;
            if let Some(&noise) = transient.samples.get(offset) {
                signal += transient.highpass.process(noise) * transient.gain.value_at(time);
            }
        }

        if let Some(tone) = self.tone_filter.as_mut() {
            tone.filter.set_cutoff(tone.cutoff.value_at(time) as f64);
            signal = tone.filter.process(signal);
        }

        signal * self.output.value_at(time)
    }

    fn end_frame(&self) -> u64 {
        self.end_frame
    }
}

fn seconds_to_frame(seconds: f64, sample_rate: f64) -> u64 {
    (seconds.max(0.0) * sample_rate).round() as u64
}

/// Sustained envelope: 0 → `peak` over `attack`, step to `sustain` at
/// `hold_fraction` of the duration, then linear release to near silence.
fn sustained(start: f64, duration: f64, attack: f64, peak: f32, sustain: f32, hold_fraction: f64) -> Automation {
    Automation::new(0.0)
        .set_value_at(0.0, start)
        .linear_ramp_to(peak, start + attack)
        .set_value_at(sustain, start + duration * hold_fraction)
        .linear_ramp_to(0.001, start + duration)
}

fn piano(request: &VoiceRequest, library: &VoiceLibrary) -> SynthVoice {
    const PARTIALS: [(f64, f32, f64); 6] = [
        (1.0, 0.25, -3.0),
        (1.0, 0.23, 3.0),
        (2.0, 0.14, 0.0),
        (3.0, 0.09, -2.0),
        (4.0, 0.06, 2.0),
        (5.0, 0.04, 0.0),
    ];

    let f = request.frequency;
    let start = request.start_time;
    let tail = Instrument::Piano.tail(request.duration);
    let sr = library.sample_rate;

    let mix = Automation::new(0.0001)
        .set_value_at(0.0001, start)
        .linear_ramp_to(0.9, start + 0.004)
        .exponential_ramp_to(0.0001, start + tail);

    let bright = (f * 12.0).clamp(1500.0, 12000.0);
    let body = (f * 5.0).clamp(1200.0, 6000.0);
    let cutoff = Automation::new(bright as f32)
        .set_value_at(bright as f32, start)
        .exponential_ramp_to(body as f32, start + 0.08);

    let hammer = Transient {
        samples: library.hammer.clone(),
        start_frame: seconds_to_frame(start, sr as f64),
        highpass: Biquad::new(FilterKind::Highpass, (f * 4.0).min(8000.0), 1.0, sr),
        gain: Automation::new(0.0001)
            .set_value_at(0.0001, start)
            .linear_ramp_to(0.08, start + 0.005)
            .exponential_ramp_to(0.0001, start + 0.03),
    };

    PARTIALS.iter().fold(
        SynthVoice::new(request, sr, start + tail)
            .mix(mix)
            .transient(hammer)
            .tone_filter(Biquad::new(FilterKind::Lowpass, bright, 0.8, sr), cutoff),
        |voice, &(multiple, amplitude, detune)| {
            voice.partial(Waveform::Sine, multiple, detune, Automation::constant(amplitude))
        },
    )
}

fn saxophone(request: &VoiceRequest, sr: u32) -> SynthVoice {
    let start = request.start_time;
    let cutoff = request.frequency * 2.0;
    SynthVoice::new(request, sr, start + request.duration)
        .partial(Waveform::Sawtooth, 1.0, 0.0, Automation::constant(1.0))
        .tone_filter(
            Biquad::new(FilterKind::Lowpass, cutoff, 1.0, sr),
            Automation::constant(cutoff as f32),
        )
        .output(sustained(start, request.duration, 0.05, 0.4, 0.35, 0.8))
}

fn guitar(request: &VoiceRequest, sr: u32) -> SynthVoice {
    let start = request.start_time;
    let end = start + request.duration;
    let envelope = Automation::new(0.0)
        .set_value_at(0.0, start)
        .linear_ramp_to(0.5, start + 0.005)
        .exponential_ramp_to(0.1, start + 0.1)
        .exponential_ramp_to(0.001, end);
    SynthVoice::new(request, sr, end)
        .partial(Waveform::Triangle, 1.0, 0.0, Automation::constant(1.0))
        .output(envelope)
}

fn flute(request: &VoiceRequest, sr: u32) -> SynthVoice {
    let start = request.start_time;
    SynthVoice::new(request, sr, start + request.duration)
        .partial(Waveform::Sine, 1.0, 0.0, Automation::constant(1.0))
        .output(sustained(start, request.duration, 0.1, 0.25, 0.2, 0.9))
}

fn violin(request: &VoiceRequest, sr: u32) -> SynthVoice {
    let start = request.start_time;
    SynthVoice::new(request, sr, start + request.duration)
        .partial(Waveform::Sawtooth, 1.0, 0.0, Automation::constant(1.0))
        .output(sustained(start, request.duration, 0.2, 0.3, 0.25, 0.8))
}

fn vocal(request: &VoiceRequest, sr: u32) -> SynthVoice {
    let start = request.start_time;
    SynthVoice::new(request, sr, start + request.duration)
        .partial(Waveform::Sine, 1.0, 0.0, Automation::constant(1.0))
        .vibrato(5.0, 3.0)
        .output(sustained(start, request.duration, 0.12, 0.35, 0.3, 0.7))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 48_000;

    fn request(frequency: f64, duration: f64, start_time: f64) -> VoiceRequest {
        VoiceRequest {
            frequency,
            duration,
            start_time,
            bus: 1,
        }
    }

    fn render_all(voice: &mut dyn Voice, frames: u64) -> Vec<f32> {
        (0..frames).map(|frame| voice.render(frame)).collect()
    }

    fn peak(samples: &[f32]) -> f32 {
        samples.iter().fold(0.0, |acc, s| acc.max(s.abs()))
    }

    #[test]
    fn every_instrument_is_silent_outside_its_window() {
        let library = VoiceLibrary::new(SR);
        for instrument in Instrument::ALL {
            let mut voice = instrument.render(&request(220.0, 0.5, 0.25), &library);
            let samples = render_all(voice.as_mut(), SR as u64 * 2);
            let start = (0.25 * SR as f64) as usize;
            let end = voice.end_frame() as usize;

            assert!(samples[..start].iter().all(|s| *s == 0.0), "{instrument} leaked before start");
            assert!(samples[end..].iter().all(|s| *s == 0.0), "{instrument} leaked after stop");
            assert!(peak(&samples[start..end]) > 0.01, "{instrument} was silent");
            assert!(peak(&samples) < 1.5, "{instrument} clipped");
        }
    }

    #[test]
    fn piano_rings_past_nominal_duration() {
        let library = VoiceLibrary::new(SR);
        let voice = Instrument::Piano.render(&request(261.63, 1.0, 0.0), &library);
        assert_eq!(voice.end_frame(), (1.6 * SR as f64).round() as u64);

        let flute = Instrument::Flute.render(&request(261.63, 1.0, 0.0), &library);
        assert_eq!(flute.end_frame(), SR as u64);
    }

    #[test]
    fn piano_attack_is_fast() {
        let library = VoiceLibrary::new(SR);
        let mut voice = Instrument::Piano.render(&request(440.0, 1.0, 0.0), &library);
        let samples = render_all(voice.as_mut(), SR as u64 / 10);
        let early = peak(&samples[(0.004 * SR as f64) as usize..(0.02 * SR as f64) as usize]);
        let late = peak(&samples[(0.08 * SR as f64) as usize..]);
        assert!(early > 0.1, "attack peak {early}");
        assert!(late < early);
    }

    #[test]
    fn flute_attack_is_slow() {
        let library = VoiceLibrary::new(SR);
        let mut voice = Instrument::Flute.render(&request(440.0, 1.0, 0.0), &library);
        let samples = render_all(voice.as_mut(), SR as u64);
        let first_10ms = peak(&samples[..(0.01 * SR as f64) as usize]);
        let sustain = peak(&samples[(0.2 * SR as f64) as usize..(0.3 * SR as f64) as usize]);
        assert!(first_10ms < 0.05);
        assert!(sustain > 0.2);
    }

    #[test]
    fn reference_tone_decays() {
        let library = VoiceLibrary::new(SR);
        let mut voice = library.reference_tone(&request(261.63, 1.1, 0.0));
        let samples = render_all(voice.as_mut(), (1.2 * SR as f64) as u64);
        let onset = peak(&samples[..(0.1 * SR as f64) as usize]);
        let tail = peak(&samples[(1.0 * SR as f64) as usize..(1.09 * SR as f64) as usize]);
        assert!(onset > 0.3);
        assert!(tail < 0.01);
        assert_eq!(voice.end_frame(), (1.1 * SR as f64).round() as u64);
    }

    #[test]
    fn instrument_names_parse() {
        for instrument in Instrument::ALL {
            assert_eq!(instrument.name().parse::<Instrument>(), Ok(instrument));
        }
        assert!("kazoo".parse::<Instrument>().is_err());
        assert_eq!(serde_json::to_string(&Instrument::Saxophone).unwrap(), "\"saxophone\"");
    }
}
