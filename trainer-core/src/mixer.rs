//! # Bus Mixer
//!
//! The mixer lives inside the output callback. Every playback request owns a
//! bus: a group of voices with a shared gain stage that is disposed as a
//! unit. The control side never touches a bus directly; it sends
//! [`MixerCommand`]s which the callback applies before rendering the next
//! buffer.

use crate::voices::Voice;

/// Identifier of a playback bus.
pub type BusId = u64;

/// Gain a fading bus ramps down to before it is dropped.
pub const FADE_FLOOR: f32 = 0.0001;

/// A bus that has been built on the control side and is waiting to be
/// attached to the mixer.
pub struct PendingBus {
    pub id: BusId,
    pub gain: f32,
    /// Engine frame at which the bus is dropped regardless of its voices.
    pub dispose_at: u64,
    pub voices: Vec<Box<dyn Voice>>,
}

impl PendingBus {
    pub fn new(id: BusId, gain: f32, dispose_at: u64) -> Self {
        Self {
            id,
            gain,
            dispose_at,
            voices: Vec::new(),
        }
    }

    pub fn attach(&mut self, voice: Box<dyn Voice>) {
        self.voices.push(voice);
    }
}

/// Commands sent from the control side to the output callback.
pub enum MixerCommand {
    Attach(PendingBus),
    /// Ramp a bus linearly to [`FADE_FLOOR`] over `fade_frames`, starting at
    /// `start_frame`, then drop it.
    Fade {
        bus: BusId,
        start_frame: u64,
        fade_frames: u64,
    },
    SetVolume(f32),
}

struct Fade {
    start_frame: u64,
    fade_frames: u64,
}

struct Bus {
    id: BusId,
    gain: f32,
    dispose_at: u64,
    voices: Vec<Box<dyn Voice>>,
    fade: Option<Fade>,
}

impl Bus {
    fn gain_at(&self, frame: u64) -> f32 {
        let Some(fade) = &self.fade else {
            return self.gain;
        };
        if frame <= fade.start_frame {
            return self.gain;
        }
        let elapsed = frame - fade.start_frame;
        if elapsed >= fade.fade_frames {
            return FADE_FLOOR;
        }
        let progress = elapsed as f32 / fade.fade_frames as f32;
        self.gain + (FADE_FLOOR - self.gain) * progress
    }

    fn finished_at(&self, frame: u64) -> bool {
        if frame >= self.dispose_at {
            return true;
        }
        match &self.fade {
            Some(fade) => frame >= fade.start_frame + fade.fade_frames,
            None => false,
        }
    }
}

/// Sums all live buses into the output buffer.
pub struct Mixer {
    buses: Vec<Bus>,
    volume: f32,
    frame: u64,
}

impl Mixer {
    pub fn new(volume: f32) -> Self {
        Self {
            buses: Vec::new(),
            volume,
            frame: 0,
        }
    }

    /// Number of frames rendered so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn bus_ids(&self) -> Vec<BusId> {
        self.buses.iter().map(|bus| bus.id).collect()
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    pub fn apply(&mut self, command: MixerCommand) {
        match command {
            MixerCommand::Attach(pending) => self.buses.push(Bus {
                id: pending.id,
                gain: pending.gain,
                dispose_at: pending.dispose_at,
                voices: pending.voices,
                fade: None,
            }),
            MixerCommand::Fade {
                bus,
                start_frame,
                fade_frames,
            } => {
                if let Some(bus) = self.buses.iter_mut().find(|b| b.id == bus) {
                    bus.fade = Some(Fade {
                        start_frame,
                        fade_frames: fade_frames.max(1),
                    });
                }
            }
            MixerCommand::SetVolume(volume) => self.volume = volume.clamp(0.0, 1.0),
        }
    }

    /// Renders `out.len() / channels` frames of interleaved audio. Every
    /// channel receives the same mono mix.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for frame_out in out.chunks_mut(channels) {
            let frame = self.frame;
            let mut sum = 0.0;
            for bus in &mut self.buses {
                let gain = bus.gain_at(frame);
                let mut bus_sum = 0.0;
                for voice in &mut bus.voices {
                    bus_sum += voice.render(frame);
                }
                sum += bus_sum * gain;
            }
            let sample = (sum * self.volume).clamp(-1.0, 1.0);
            frame_out.fill(sample);

            self.frame += 1;
            let now = self.frame;
            self.buses.retain(|bus| !bus.finished_at(now));
        }
    }
}
