//! # Playback Transport
//!
//! Turns play requests into scheduled voices on a single audio output and
//! guarantees that at most one playback bus is live at a time.
//!
//! ## Features
//! - Lazy output initialization on first use; an initialization failure is
//!   reported once and later requests become no-ops
//! - One bus per request: note, interval, chord, scale or reference tone
//! - Supersession: a new request fades the live bus out over a short ramp
//! - Deferred disposal after `ceil(total × tail_factor)` plus padding
//! - Master volume applied after every bus

use crate::audio::{AudioSink, OutputBackend};
use crate::config::PlaybackConfig;
use crate::error::EngineError;
use crate::mixer::{BusId, MixerCommand, PendingBus};
use crate::tuning::Note;
use crate::voices::{Instrument, VoiceLibrary, VoiceRequest};
use std::collections::HashMap;

/// Voices are scheduled this far ahead of the output clock so their first
/// samples are not already behind the callback.
const SCHEDULE_LEAD_SECS: f64 = 0.01;

/// Returned by every play call that scheduled something. All positions are
/// engine frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusHandle {
    pub id: BusId,
    pub starts_at: u64,
    /// End of the nominal sound (before any instrument tail).
    pub ends_at: u64,
    pub disposes_at: u64,
}

enum OutputState {
    Uninitialized,
    Ready(Box<dyn AudioSink>),
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
enum Sound {
    Instrument(Instrument),
    ReferenceTone,
}

/// One note inside a request, relative to the request start.
#[derive(Debug, Clone, Copy)]
struct Placement {
    frequency: f64,
    offset: f64,
    duration: f64,
}

#[derive(Debug, Clone, Copy)]
struct BusRecord {
    handle: BusHandle,
    superseded: bool,
}

pub struct PlaybackTransport {
    backend: Box<dyn OutputBackend>,
    state: OutputState,
    library: Option<VoiceLibrary>,
    config: PlaybackConfig,
    volume: f32,
    arena: HashMap<BusId, BusRecord>,
    live: Option<BusId>,
    next_bus: BusId,
}

impl PlaybackTransport {
    pub fn new(backend: Box<dyn OutputBackend>, config: PlaybackConfig) -> Self {
        let volume = config.volume.clamp(0.0, 1.0);
        Self {
            backend,
            state: OutputState::Uninitialized,
            library: None,
            config,
            volume,
            arena: HashMap::new(),
            live: None,
            next_bus: 1,
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Opens the output if needed.
    ///
    /// # Returns
    /// * `Ok(true)` - The output is running
    /// * `Ok(false)` - The output failed earlier; nothing is retried
    /// * `Err(EngineError::OutputUnavailable)` - Opening failed just now
    pub fn initialize(&mut self) -> Result<bool, EngineError> {
        match &mut self.state {
            OutputState::Ready(sink) => {
                if let Err(e) = sink.resume() {
                    log::warn!(target: "transport", "Failed to resume output: {e:#}");
                }
                return Ok(true);
            }
            OutputState::Failed(_) => return Ok(false),
            OutputState::Uninitialized => {}
        }

        match self.backend.open() {
            Ok(mut sink) => {
                if let Err(e) = sink.resume() {
                    log::warn!(target: "transport", "Failed to resume output: {e:#}");
                }
                if let Err(e) = sink.send(MixerCommand::SetVolume(self.volume)) {
                    log::warn!(target: "transport", "Failed to set volume: {e:#}");
                }
                log::info!(target: "transport", "Audio output ready at {} Hz", sink.sample_rate());
                self.library = Some(VoiceLibrary::new(sink.sample_rate()));
                self.state = OutputState::Ready(sink);
                Ok(true)
            }
            Err(e) => {
                let message = format!("{e:#}");
                log::error!(target: "transport", "Failed to initialize audio: {message}");
                self.state = OutputState::Failed(message.clone());
                Err(EngineError::OutputUnavailable(message))
            }
        }
    }

    /// Closes the output. The next play request opens it again.
    pub fn shutdown(&mut self) {
        if matches!(self.state, OutputState::Ready(_)) {
            log::info!(target: "transport", "Audio output closed");
        }
        self.state = OutputState::Uninitialized;
        self.library = None;
        self.arena.clear();
        self.live = None;
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, OutputState::Ready(_))
    }

    /// Why the output could not be opened, if it failed.
    pub fn failure(&self) -> Option<&str> {
        match &self.state {
            OutputState::Failed(message) => Some(message),
            _ => None,
        }
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sink().map(|sink| sink.sample_rate())
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Sets the master volume, clamped to 0..=1.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        self.send(MixerCommand::SetVolume(self.volume));
    }

    /// The bus that has not been superseded, if it is still scheduled.
    pub fn live_bus(&mut self) -> Option<BusHandle> {
        self.prune();
        self.live.and_then(|id| self.arena.get(&id)).map(|record| record.handle)
    }

    /// Buses that have not been disposed yet, live or fading.
    pub fn scheduled_buses(&mut self) -> usize {
        self.prune();
        self.arena.len()
    }

    /// True while the live bus is inside its nominal duration.
    pub fn is_playing(&mut self) -> bool {
        let Some(frame) = self.current_frame() else {
            return false;
        };
        self.live_bus().is_some_and(|bus| frame < bus.ends_at)
    }

    pub fn play_note(
        &mut self,
        note: &Note,
        instrument: Instrument,
        duration: f64,
    ) -> Result<Option<BusHandle>, EngineError> {
        let placement = Placement {
            frequency: note.frequency(),
            offset: 0.0,
            duration,
        };
        self.schedule(Sound::Instrument(instrument), 1.0, &[placement], duration)
    }

    /// Two notes of the configured interval length, the second starting
    /// after the first plus `gap` seconds. `None` uses the configured gap.
    pub fn play_interval(
        &mut self,
        first: &Note,
        second: &Note,
        instrument: Instrument,
        gap: Option<f64>,
    ) -> Result<Option<BusHandle>, EngineError> {
        let length = self.config.interval_note_secs;
        let gap = gap.unwrap_or(self.config.interval_gap_secs).max(0.0);
        let placements = [
            Placement {
                frequency: first.frequency(),
                offset: 0.0,
                duration: length,
            },
            Placement {
                frequency: second.frequency(),
                offset: length + gap,
                duration: length,
            },
        ];
        self.schedule(Sound::Instrument(instrument), 1.0, &placements, 2.0 * length + gap)
    }

    /// All notes at once, scaled by `1/sqrt(n)`. An empty chord does nothing.
    pub fn play_chord(
        &mut self,
        notes: &[Note],
        instrument: Instrument,
        duration: Option<f64>,
    ) -> Result<Option<BusHandle>, EngineError> {
        if notes.is_empty() {
            return Ok(None);
        }
        let duration = duration.unwrap_or(self.config.chord_duration_secs);
        let gain = 1.0 / (notes.len() as f32).sqrt();
        let placements: Vec<Placement> = notes
            .iter()
            .map(|note| Placement {
                frequency: note.frequency(),
                offset: 0.0,
                duration,
            })
            .collect();
        self.schedule(Sound::Instrument(instrument), gain, &placements, duration)
    }

    /// Notes one after another. An empty scale does nothing. `None` uses the
    /// configured note length and gap.
    pub fn play_scale(
        &mut self,
        notes: &[Note],
        instrument: Instrument,
        note_duration: Option<f64>,
        gap: Option<f64>,
    ) -> Result<Option<BusHandle>, EngineError> {
        if notes.is_empty() {
            return Ok(None);
        }
        let note_duration = note_duration.unwrap_or(self.config.scale_note_secs);
        let gap = gap.unwrap_or(self.config.scale_gap_secs).max(0.0);
        let step = note_duration + gap;
        let placements: Vec<Placement> = notes
            .iter()
            .enumerate()
            .map(|(i, note)| Placement {
                frequency: note.frequency(),
                offset: i as f64 * step,
                duration: note_duration,
            })
            .collect();
        let total = notes.len() as f64 * note_duration + (notes.len() - 1) as f64 * gap;
        self.schedule(Sound::Instrument(instrument), 1.0, &placements, total)
    }

    /// The two-partial pure tone used as a starting-pitch cue.
    pub fn play_reference_tone(
        &mut self,
        note: &Note,
        duration: Option<f64>,
    ) -> Result<Option<BusHandle>, EngineError> {
        let duration = duration.unwrap_or(self.config.reference_duration_secs);
        let placement = Placement {
            frequency: note.frequency(),
            offset: 0.0,
            duration,
        };
        self.schedule(Sound::ReferenceTone, 1.0, &[placement], duration)
    }

    fn schedule(
        &mut self,
        sound: Sound,
        gain: f32,
        placements: &[Placement],
        total: f64,
    ) -> Result<Option<BusHandle>, EngineError> {
        if !self.initialize()? {
            return Ok(None);
        }
        let (Some(now), Some(sample_rate)) = (self.current_frame(), self.sample_rate()) else {
            return Ok(None);
        };
        let sr = sample_rate as f64;

        self.prune();
        self.supersede(now);

        let start_time = now as f64 / sr + SCHEDULE_LEAD_SECS;
        let starts_at = (start_time * sr).round() as u64;
        // The epsilon keeps float noise such as 1980.0000000000002 from adding a millisecond.
        let lifetime_ms = (total * self.config.tail_factor * 1000.0 - 1e-6).ceil().max(0.0) as u64
            + self.config.tail_padding_ms;
        let handle = BusHandle {
            id: self.next_bus,
            starts_at,
            ends_at: starts_at + (total * sr).round() as u64,
            disposes_at: now + ms_to_frames(lifetime_ms, sample_rate),
        };
        self.next_bus += 1;

        let Some(library) = self.library.as_ref() else {
            return Ok(None);
        };
        let mut bus = PendingBus::new(handle.id, gain, handle.disposes_at);
        for placement in placements {
            let request = VoiceRequest {
                frequency: placement.frequency,
                duration: placement.duration,
                start_time: start_time + placement.offset,
                bus: handle.id,
            };
            let voice = match sound {
                Sound::Instrument(instrument) => instrument.render(&request, library),
                Sound::ReferenceTone => library.reference_tone(&request),
            };
            bus.attach(voice);
        }

        if !self.send(MixerCommand::Attach(bus)) {
            return Ok(None);
        }

        log::debug!(
            target: "transport",
            "bus {} scheduled with {} voice(s), disposed at frame {}",
            handle.id,
            placements.len(),
            handle.disposes_at
        );
        self.arena.insert(
            handle.id,
            BusRecord {
                handle,
                superseded: false,
            },
        );
        self.live = Some(handle.id);
        Ok(Some(handle))
    }

    /// Fades the live bus out and schedules its early disposal.
    fn supersede(&mut self, now: u64) {
        let Some(id) = self.live.take() else {
            return;
        };
        let Some(sample_rate) = self.sample_rate() else {
            return;
        };
        let fade_frames = ms_to_frames(self.config.fade_ms, sample_rate);
        self.send(MixerCommand::Fade {
            bus: id,
            start_frame: now,
            fade_frames,
        });
        if let Some(record) = self.arena.get_mut(&id) {
            record.superseded = true;
            record.handle.disposes_at = record.handle.disposes_at.min(now + fade_frames);
        }
        log::debug!(target: "transport", "bus {id} superseded");
    }

    /// Forgets buses whose disposal frame has passed.
    fn prune(&mut self) {
        let Some(now) = self.current_frame() else {
            return;
        };
        self.arena.retain(|_, record| record.handle.disposes_at > now);
        if let Some(id) = self.live {
            if !self.arena.contains_key(&id) {
                self.live = None;
            }
        }
    }

    fn sink(&self) -> Option<&dyn AudioSink> {
        match &self.state {
            OutputState::Ready(sink) => Some(sink.as_ref()),
            _ => None,
        }
    }

    fn current_frame(&self) -> Option<u64> {
        self.sink().map(|sink| sink.current_frame())
    }

    /// Sends a command to the output. Failures are logged and reported as
    /// `false`; playback degrades to silence.
    fn send(&self, command: MixerCommand) -> bool {
        let Some(sink) = self.sink() else {
            return false;
        };
        match sink.send(command) {
            Ok(()) => true,
            Err(e) => {
                log::error!(target: "transport", "Failed to reach audio output: {e:#}");
                false
            }
        }
    }

    #[cfg(test)]
    fn is_superseded(&self, id: BusId) -> Option<bool> {
        self.arena.get(&id).map(|record| record.superseded)
    }
}

fn ms_to_frames(ms: u64, sample_rate: u32) -> u64 {
    (ms * sample_rate as u64).div_ceil(1000)
}
