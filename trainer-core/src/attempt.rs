//! # Attempt State Machine
//!
//! Scores one sung-pitch question. The machine is a pure transition
//! function: it consumes play requests, pitch estimates and timer expirations
//! stamped with the control-clock time, and returns the [`Effect`]s its owner
//! must carry out (play the tone, drive the tracker, arm or cancel timers,
//! report the result). Nothing here sleeps or touches a device.
//!
//! ## Lifecycle
//! `Idle → AwaitingFirstPlay → Listening → Locked | Failed → Idle`
//!
//! The first play starts the attempt clock and the deadline timer. Every
//! play (first or replay) pauses capture and re-arms the listen delay;
//! capture resumes when the delay fires. A replay never resets the deadline
//! or the best match.

use crate::config::AttemptConfig;
use crate::tuning::{Note, calculate_cents_deviation};
use std::fmt::Write as _;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttemptPhase {
    /// No question loaded.
    #[default]
    Idle,
    AwaitingFirstPlay,
    /// The attempt clock is running.
    Listening,
    Locked,
    Failed,
}

/// Timers the machine asks its owner to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Gap between triggering the tone and opening capture.
    ListenDelay,
    /// Maximum attempt duration.
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttemptEvent {
    Play,
    /// Smoothed frequency from one analysis frame.
    Estimate(Option<f32>),
    TimerFired(TimerKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    PlayTarget,
    PauseTracker,
    /// Start the tracker if needed, then resume it.
    StartListening,
    StopTracker,
    StartTimer { kind: TimerKind, delay: Duration },
    CancelTimer(TimerKind),
    Report(AttemptResult),
}

/// Running state of the active attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attempt {
    pub started_at: Duration,
    pub best_cents_off: Option<f64>,
    pub best_frequency: Option<f64>,
    pub hold_started_at: Option<Duration>,
    pub deadline_at: Duration,
}

/// Outcome handed to the session once an attempt resolves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptResult {
    pub success: bool,
    pub best_frequency: Option<f64>,
    pub best_cents_off: Option<f64>,
    pub response_time: Duration,
}

impl AttemptResult {
    /// Human-readable best match, e.g. `12.3 cents below the target note (C4)`.
    pub fn describe(&self, target: &Note) -> String {
        let Some(cents) = self.best_cents_off else {
            return "no clear pitch".to_string();
        };
        if cents == 0.0 {
            return format!("right on the target note ({target})");
        }
        let direction = if cents < 0.0 { "below" } else { "above" };
        let mut text = String::new();
        let _ = write!(text, "{:.1} cents {direction} the target note ({target})", cents.abs());
        text
    }
}

#[derive(Debug, Clone)]
pub struct AttemptMachine {
    config: AttemptConfig,
    phase: AttemptPhase,
    target_frequency: f64,
    attempt: Option<Attempt>,
    capturing: bool,
    listen_pending: bool,
}

impl AttemptMachine {
    pub fn new(config: AttemptConfig) -> Self {
        Self {
            config,
            phase: AttemptPhase::Idle,
            target_frequency: 0.0,
            attempt: None,
            capturing: false,
            listen_pending: false,
        }
    }

    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    pub fn attempt(&self) -> Option<&Attempt> {
        self.attempt.as_ref()
    }

    pub fn target_frequency(&self) -> f64 {
        self.target_frequency
    }

    /// True once the listen delay has fired and until the next play or
    /// resolution.
    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.phase, AttemptPhase::Locked | AttemptPhase::Failed)
    }

    /// Time since the first play, or zero before it.
    pub fn elapsed(&self, now: Duration) -> Duration {
        match (&self.attempt, self.phase) {
            (Some(attempt), AttemptPhase::Listening) => now.saturating_sub(attempt.started_at),
            _ => Duration::ZERO,
        }
    }

    /// Current in-tune hold as a fraction of the hold duration.
    pub fn hold_progress(&self, now: Duration) -> f64 {
        let Some(start) = self.attempt.and_then(|a| a.hold_started_at) else {
            return 0.0;
        };
        let held = now.saturating_sub(start).as_secs_f64();
        (held / self.config.hold().as_secs_f64()).min(1.0)
    }

    /// Drops any running attempt and waits for the first play of a new
    /// target.
    pub fn load(&mut self, target_frequency: f64) -> Vec<Effect> {
        let effects = self.reset();
        self.target_frequency = target_frequency;
        self.phase = AttemptPhase::AwaitingFirstPlay;
        effects
    }

    /// Leaves the current question.
    pub fn advance(&mut self) -> Vec<Effect> {
        self.reset()
    }

    fn reset(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.listen_pending {
            effects.push(Effect::CancelTimer(TimerKind::ListenDelay));
        }
        if self.phase == AttemptPhase::Listening {
            effects.push(Effect::CancelTimer(TimerKind::Deadline));
        }
        if self.phase != AttemptPhase::Idle {
            effects.push(Effect::StopTracker);
        }

        self.phase = AttemptPhase::Idle;
        self.attempt = None;
        self.capturing = false;
        self.listen_pending = false;
        effects
    }

    pub fn handle(&mut self, event: AttemptEvent, now: Duration) -> Vec<Effect> {
        match event {
            AttemptEvent::Play => self.on_play(now),
            AttemptEvent::Estimate(frequency) => self.on_estimate(frequency, now),
            AttemptEvent::TimerFired(TimerKind::ListenDelay) => self.on_listen_delay(),
            AttemptEvent::TimerFired(TimerKind::Deadline) => self.on_deadline(now),
        }
    }

    fn on_play(&mut self, now: Duration) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.phase {
            AttemptPhase::AwaitingFirstPlay => {
                let max = self.config.max_attempt();
                self.attempt = Some(Attempt {
                    started_at: now,
                    best_cents_off: None,
                    best_frequency: None,
                    hold_started_at: None,
                    deadline_at: now + max,
                });
                self.phase = AttemptPhase::Listening;
                effects.push(Effect::StartTimer {
                    kind: TimerKind::Deadline,
                    delay: max,
                });
            }
            AttemptPhase::Listening => {}
            AttemptPhase::Idle | AttemptPhase::Locked | AttemptPhase::Failed => return effects,
        }

        if self.capturing {
            effects.push(Effect::PauseTracker);
            self.capturing = false;
        }
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.hold_started_at = None;
        }

        effects.push(Effect::PlayTarget);
        if self.listen_pending {
            effects.push(Effect::CancelTimer(TimerKind::ListenDelay));
        }
        effects.push(Effect::StartTimer {
            kind: TimerKind::ListenDelay,
            delay: self.config.listen_delay(),
        });
        self.listen_pending = true;
        effects
    }

    fn on_listen_delay(&mut self) -> Vec<Effect> {
        self.listen_pending = false;
        if self.phase != AttemptPhase::Listening {
            return Vec::new();
        }
        self.capturing = true;
        vec![Effect::StartListening]
    }

    fn on_deadline(&mut self, now: Duration) -> Vec<Effect> {
        if self.phase != AttemptPhase::Listening {
            return Vec::new();
        }
        log::info!(target: "attempt", "Deadline reached without lock");
        self.resolve(false, now)
    }

    fn on_estimate(&mut self, frequency: Option<f32>, now: Duration) -> Vec<Effect> {
        if self.phase != AttemptPhase::Listening || !self.capturing {
            return Vec::new();
        }
        let target = self.target_frequency;
        let tolerance = self.config.tolerance_cents;
        let hold = self.config.hold();
        let Some(attempt) = self.attempt.as_mut() else {
            return Vec::new();
        };

        let Some(frequency) = frequency.map(f64::from).filter(|f| *f > 0.0) else {
            attempt.hold_started_at = None;
            return Vec::new();
        };

        let cents = calculate_cents_deviation(frequency, target);
        if attempt.best_cents_off.is_none_or(|best| cents.abs() < best.abs()) {
            attempt.best_cents_off = Some(cents);
            attempt.best_frequency = Some(frequency);
        }

        if cents.abs() > tolerance {
            attempt.hold_started_at = None;
            return Vec::new();
        }

        let hold_started_at = attempt.hold_started_at;
        match hold_started_at {
            None => {
                attempt.hold_started_at = Some(now);
                Vec::new()
            }
            Some(start) if now.saturating_sub(start) >= hold => {
                log::info!(target: "attempt", "Locked at {frequency:.2} Hz ({cents:+.1} cents)");
                self.resolve(true, now)
            }
            Some(_) => Vec::new(),
        }
    }

    fn resolve(&mut self, success: bool, now: Duration) -> Vec<Effect> {
        let Some(attempt) = self.attempt else {
            return Vec::new();
        };

        let mut effects = Vec::new();
        if success {
            effects.push(Effect::CancelTimer(TimerKind::Deadline));
        }
        if self.listen_pending {
            effects.push(Effect::CancelTimer(TimerKind::ListenDelay));
        }
        effects.push(Effect::StopTracker);
        effects.push(Effect::Report(AttemptResult {
            success,
            best_frequency: attempt.best_frequency,
            best_cents_off: attempt.best_cents_off,
            response_time: now.saturating_sub(attempt.started_at),
        }));

        self.phase = if success {
            AttemptPhase::Locked
        } else {
            AttemptPhase::Failed
        };
        self.capturing = false;
        self.listen_pending = false;
        effects
    }
}
