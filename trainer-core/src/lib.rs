//! The core engine of the pitch ear-trainer.
//! This crate synthesizes instrument tones, schedules them on an explicit
//! audio engine, tracks a singer's pitch from the microphone and scores
//! hold-to-lock attempts. It contains no UI code.

pub mod attempt;
pub mod audio;
pub mod clock;
pub mod config;
pub mod dsp;
pub mod error;
pub mod fft;
pub mod mixer;
pub mod pitch;
pub mod scheduler;
pub mod session;
pub mod tracker;
pub mod trainer;
pub mod transport;
pub mod tuning;
pub mod voices;

pub use attempt::{AttemptMachine, AttemptPhase, AttemptResult};
pub use config::TrainerConfig;
pub use error::EngineError;
pub use session::{GameSession, PitchAnswer, PitchQuestion};
pub use tracker::{PitchListener, PitchTracker, TrackerState, TrackerStatus};
pub use trainer::{PitchExercise, PitchTrainer};
pub use transport::PlaybackTransport;
pub use tuning::{Note, PitchClass};
pub use voices::Instrument;

use std::time::Duration;

/// The result of a single analysis frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchEstimate {
    /// Smoothed fundamental in Hz, absent when no reliable pitch has been
    /// seen within the fallback window.
    pub frequency: Option<f32>,
    /// Raw clarity of this frame's candidate (0.0 to 1.0).
    pub clarity: f32,
    /// Raw RMS amplitude of this frame's window.
    pub rms: f32,
    /// When the frame was analysed, on the control clock.
    pub at: Duration,
}

impl PitchEstimate {
    /// A frame with no pitch and zero levels.
    pub fn silent(at: Duration) -> Self {
        Self {
            frequency: None,
            clarity: 0.0,
            rms: 0.0,
            at,
        }
    }
}
