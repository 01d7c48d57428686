//! # Session Layer
//!
//! Bookkeeping for one game of sung-pitch questions: which question is
//! current, the answers so far, whether a result is being shown, and the
//! finished record handed once to an external store. Question generation and
//! persistence stay outside the crate behind [`QuestionSource`] and
//! [`SessionStore`].

use crate::tuning::Note;
use crate::voices::Instrument;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_LEVEL: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PitchQuestion {
    pub id: u32,
    pub target: Note,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PitchAnswer {
    pub question_id: u32,
    pub detected_frequency: Option<f64>,
    pub cents_off: Option<f64>,
    pub is_correct: bool,
    pub response_time_ms: u64,
}

/// A game as handed to persistence. Times are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitchSessionRecord {
    pub level: u32,
    pub instrument: Instrument,
    pub questions: Vec<PitchQuestion>,
    pub answers: Vec<PitchAnswer>,
    pub start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
}

impl PitchSessionRecord {
    pub fn is_finished(&self) -> bool {
        self.answers.len() == self.questions.len()
    }

    pub fn summary(&self) -> SessionSummary {
        let answered = self.answers.len();
        let correct = self.answers.iter().filter(|a| a.is_correct).count();
        let accuracy_percent = if answered == 0 {
            0.0
        } else {
            correct as f64 * 100.0 / answered as f64
        };
        let mean_response_ms = (answered > 0).then(|| {
            self.answers.iter().map(|a| a.response_time_ms as f64).sum::<f64>() / answered as f64
        });
        let offsets: Vec<f64> = self.answers.iter().filter_map(|a| a.cents_off).map(f64::abs).collect();
        let mean_abs_cents =
            (!offsets.is_empty()).then(|| offsets.iter().sum::<f64>() / offsets.len() as f64);

        SessionSummary {
            questions: self.questions.len(),
            answered,
            correct,
            accuracy_percent,
            mean_response_ms,
            mean_abs_cents,
        }
    }
}

/// Aggregate figures for one session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSummary {
    pub questions: usize,
    pub answered: usize,
    pub correct: usize,
    pub accuracy_percent: f64,
    pub mean_response_ms: Option<f64>,
    pub mean_abs_cents: Option<f64>,
}

/// Supplies the questions for a level.
pub trait QuestionSource: Send {
    fn generate(&mut self, level: u32) -> Vec<PitchQuestion>;
}

/// Receives each finished session exactly once.
pub trait SessionStore: Send {
    fn save(&mut self, session: &PitchSessionRecord) -> Result<()>;
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Game state driven by the view layer.
#[derive(Debug, Clone)]
pub struct GameSession {
    current: Option<PitchSessionRecord>,
    question_index: usize,
    show_result: bool,
    selected_level: u32,
    selected_instrument: Instrument,
    saved: bool,
}

impl Default for GameSession {
    fn default() -> Self {
        Self {
            current: None,
            question_index: 0,
            show_result: false,
            selected_level: DEFAULT_LEVEL,
            selected_instrument: Instrument::Voice,
            saved: false,
        }
    }
}

impl GameSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_game(&mut self, level: u32, instrument: Instrument, questions: Vec<PitchQuestion>) {
        self.current = Some(PitchSessionRecord {
            level,
            instrument,
            questions,
            answers: Vec::new(),
            start_time: unix_millis(),
            end_time: None,
        });
        self.question_index = 0;
        self.show_result = false;
        self.saved = false;
    }

    /// Records the answer for the current question and shows its result.
    /// The session end time is stamped on the last question.
    pub fn submit_answer(
        &mut self,
        detected_frequency: Option<f64>,
        cents_off: Option<f64>,
        response_time_ms: u64,
        is_correct: bool,
    ) {
        let index = self.question_index;
        let Some(session) = self.current.as_mut() else {
            return;
        };
        let Some(question_id) = session.questions.get(index).map(|q| q.id) else {
            return;
        };

        session.answers.push(PitchAnswer {
            question_id,
            detected_frequency,
            cents_off,
            is_correct,
            response_time_ms,
        });
        if index + 1 >= session.questions.len() {
            session.end_time = Some(unix_millis());
        }
        self.show_result = true;
    }

    pub fn next_question(&mut self) {
        if self.current.is_none() {
            return;
        }
        self.question_index += 1;
        self.show_result = false;
    }

    /// Drops the session but keeps the selected level and instrument.
    pub fn end_game(&mut self) {
        *self = Self {
            selected_level: self.selected_level,
            selected_instrument: self.selected_instrument,
            ..Self::default()
        };
    }

    pub fn set_level(&mut self, level: u32) {
        self.selected_level = level;
    }

    pub fn set_instrument(&mut self, instrument: Instrument) {
        self.selected_instrument = instrument;
    }

    pub fn selected_level(&self) -> u32 {
        self.selected_level
    }

    pub fn selected_instrument(&self) -> Instrument {
        self.selected_instrument
    }

    pub fn session(&self) -> Option<&PitchSessionRecord> {
        self.current.as_ref()
    }

    pub fn question_index(&self) -> usize {
        self.question_index
    }

    pub fn current_question(&self) -> Option<&PitchQuestion> {
        self.current.as_ref()?.questions.get(self.question_index)
    }

    pub fn show_result(&self) -> bool {
        self.show_result
    }

    /// True once the view has moved past the last question.
    pub fn is_game_complete(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| self.question_index >= s.questions.len())
    }

    /// The finished session, the first time it is asked for.
    pub fn take_finished(&mut self) -> Option<&PitchSessionRecord> {
        if self.saved {
            return None;
        }
        let session = self.current.as_ref().filter(|s| s.is_finished())?;
        self.saved = true;
        Some(session)
    }
}
