//! # Pitch Trainer
//!
//! Runs the attempt state machine against real collaborators: the playback
//! transport, a pitch listener and a timer scheduler on the control clock.
//! [`PitchExercise`] adds the game session on top, so a view layer only has
//! to call `start_game`, `play`, `pump`, `next_question` and `end_game`.
//!
//! The owner drives time by calling [`PitchTrainer::pump`] regularly (for
//! example every frame, or at [`PitchTrainer::next_wakeup`]). Each pump
//! delivers queued estimates in order and fires every timer that came due
//! before them, so timer and estimate events reach the state machine in
//! timestamp order.

use crate::PitchEstimate;
use crate::attempt::{Attempt, AttemptEvent, AttemptMachine, AttemptPhase, AttemptResult, Effect, TimerKind};
use crate::audio::{CpalCapture, CpalOutput};
use crate::clock::{Clock, SystemClock};
use crate::config::TrainerConfig;
use crate::error::EngineError;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::session::{GameSession, PitchQuestion, PitchSessionRecord, QuestionSource, SessionStore};
use crate::tracker::{PitchListener, PitchTracker, TrackerStatus};
use crate::transport::PlaybackTransport;
use crate::tuning::{Note, calculate_cents_deviation};
use crate::voices::Instrument;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct PitchTrainer {
    machine: AttemptMachine,
    transport: PlaybackTransport,
    listener: Box<dyn PitchListener>,
    scheduler: Scheduler<TimerKind>,
    timers: HashMap<TimerKind, TimerHandle>,
    clock: Arc<dyn Clock>,
    target: Option<Note>,
    instrument: Instrument,
    note_duration: f64,
    playback_error: Option<EngineError>,
}

impl PitchTrainer {
    pub fn new(
        config: &TrainerConfig,
        transport: PlaybackTransport,
        listener: Box<dyn PitchListener>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            machine: AttemptMachine::new(config.attempt.clone()),
            transport,
            listener,
            scheduler: Scheduler::new(),
            timers: HashMap::new(),
            clock,
            target: None,
            instrument: Instrument::Voice,
            note_duration: config.attempt.note_duration_secs,
            playback_error: None,
        }
    }

    /// Builds a trainer on the default output and input devices.
    pub fn with_default_devices(config: &TrainerConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let transport = PlaybackTransport::new(
            Box::new(CpalOutput::new(config.playback.volume)),
            config.playback.clone(),
        );
        let tracker = PitchTracker::new(Arc::new(CpalCapture), Arc::clone(&clock), config.tracker.clone());
        Self::new(config, transport, Box::new(tracker), clock)
    }

    /// Prepares an attempt at `target`, abandoning any running one.
    pub fn load_question(&mut self, target: Note, instrument: Instrument) {
        let now = self.clock.now();
        let effects = self.machine.load(target.frequency());
        self.target = Some(target);
        self.instrument = instrument;
        self.apply(effects, now);
    }

    /// Plays the target tone, starting the attempt on the first call.
    ///
    /// # Returns
    /// * `Err(EngineError::OutputUnavailable)` - The output failed to open on
    ///   this call. The attempt still runs; only the tone is missing.
    pub fn play(&mut self) -> Result<(), EngineError> {
        let now = self.clock.now();
        let effects = self.machine.handle(AttemptEvent::Play, now);
        self.apply(effects, now);
        match self.playback_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delivers pending estimates and due timers.
    ///
    /// # Returns
    /// * `Some(result)` - The attempt resolved during this pump
    pub fn pump(&mut self) -> Option<AttemptResult> {
        let estimates: Vec<PitchEstimate> = self.listener.estimates().try_iter().collect();
        let mut result = None;
        for estimate in estimates {
            result = result.or(self.fire_due(estimate.at));
            let effects = self
                .machine
                .handle(AttemptEvent::Estimate(estimate.frequency), estimate.at);
            result = result.or(self.apply(effects, estimate.at));
        }
        let now = self.clock.now();
        result.or(self.fire_due(now))
    }

    /// Leaves the current question and releases the tracker.
    pub fn stop(&mut self) {
        let now = self.clock.now();
        let effects = self.machine.advance();
        self.apply(effects, now);
        self.scheduler.cancel_all();
        self.timers.clear();
        self.target = None;
        self.listener.stop_listening();
    }

    /// Stops any attempt and closes the audio output. The next play opens
    /// it again.
    pub fn shutdown(&mut self) {
        self.stop();
        self.transport.shutdown();
    }

    /// When the next timer is due.
    pub fn next_wakeup(&mut self) -> Option<Duration> {
        self.scheduler.next_deadline()
    }

    pub fn phase(&self) -> AttemptPhase {
        self.machine.phase()
    }

    pub fn attempt(&self) -> Option<&Attempt> {
        self.machine.attempt()
    }

    pub fn target(&self) -> Option<&Note> {
        self.target.as_ref()
    }

    pub fn tracker_status(&self) -> TrackerStatus {
        self.listener.status()
    }

    /// Live offset of the tracked pitch from the target, for a meter.
    pub fn live_cents_off(&self) -> Option<f64> {
        let target = self.target?;
        let frequency = self.listener.status().frequency?;
        Some(calculate_cents_deviation(frequency as f64, target.frequency()))
    }

    pub fn hold_progress(&self) -> f64 {
        self.machine.hold_progress(self.clock.now())
    }

    pub fn elapsed(&self) -> Duration {
        self.machine.elapsed(self.clock.now())
    }

    pub fn transport(&mut self) -> &mut PlaybackTransport {
        &mut self.transport
    }

    fn fire_due(&mut self, now: Duration) -> Option<AttemptResult> {
        let mut result = None;
        while let Some((handle, deadline, kind)) = self.scheduler.pop_due(now) {
            if self.timers.get(&kind) == Some(&handle) {
                self.timers.remove(&kind);
            }
            let effects = self.machine.handle(AttemptEvent::TimerFired(kind), deadline);
            result = result.or(self.apply(effects, deadline));
        }
        result
    }

    fn apply(&mut self, effects: Vec<Effect>, at: Duration) -> Option<AttemptResult> {
        let mut result = None;
        for effect in effects {
            match effect {
                Effect::PlayTarget => self.play_target(),
                Effect::PauseTracker => self.listener.pause_listening(),
                Effect::StartListening => {
                    self.listener.start_listening();
                    self.listener.resume_listening();
                }
                Effect::StopTracker => self.listener.stop_listening(),
                Effect::StartTimer { kind, delay } => {
                    if let Some(old) = self.timers.remove(&kind) {
                        self.scheduler.cancel(old);
                    }
                    let handle = self.scheduler.schedule(at, delay, kind);
                    self.timers.insert(kind, handle);
                }
                Effect::CancelTimer(kind) => {
                    if let Some(handle) = self.timers.remove(&kind) {
                        self.scheduler.cancel(handle);
                    }
                }
                Effect::Report(report) => {
                    log::info!(
                        target: "attempt",
                        "Attempt {} after {} ms",
                        if report.success { "locked" } else { "failed" },
                        report.response_time.as_millis()
                    );
                    result = Some(report);
                }
            }
        }
        result
    }

    fn play_target(&mut self) {
        let Some(target) = self.target else {
            return;
        };
        if let Err(e) = self.transport.play_note(&target, self.instrument, self.note_duration) {
            log::error!(target: "attempt", "Failed to play target: {e}");
            self.playback_error = Some(e);
        }
    }
}

/// The sung-pitch exercise: a game session driving a [`PitchTrainer`].
pub struct PitchExercise {
    trainer: PitchTrainer,
    game: GameSession,
    questions: Box<dyn QuestionSource>,
    store: Box<dyn SessionStore>,
    last_result: Option<AttemptResult>,
}

impl PitchExercise {
    pub fn new(trainer: PitchTrainer, questions: Box<dyn QuestionSource>, store: Box<dyn SessionStore>) -> Self {
        Self {
            trainer,
            game: GameSession::new(),
            questions,
            store,
            last_result: None,
        }
    }

    pub fn start_game(&mut self, level: u32, instrument: Instrument) {
        let questions = self.questions.generate(level);
        log::info!(target: "session", "Starting level {level} on {instrument} with {} question(s)", questions.len());
        self.game.start_game(level, instrument, questions);
        self.last_result = None;
        self.load_current();
    }

    /// Plays the current target. Ignored while a result is shown.
    pub fn play(&mut self) -> Result<(), EngineError> {
        if self.game.show_result() || self.game.current_question().is_none() {
            return Ok(());
        }
        self.trainer.play()
    }

    /// Advances the trainer and records an answer when the attempt resolves.
    pub fn pump(&mut self) -> Option<AttemptResult> {
        let result = self.trainer.pump()?;
        self.game.submit_answer(
            result.best_frequency,
            result.best_cents_off,
            result.response_time.as_millis() as u64,
            result.success,
        );
        self.last_result = Some(result);

        if let Some(record) = self.game.take_finished() {
            match self.store.save(record) {
                Ok(()) => log::info!(target: "session", "Session saved"),
                Err(e) => log::error!(target: "session", "Failed to save session: {e:#}"),
            }
        }
        Some(result)
    }

    /// Moves on and plays the next target automatically.
    pub fn next_question(&mut self) -> Result<(), EngineError> {
        self.game.next_question();
        self.last_result = None;
        if self.game.is_game_complete() {
            self.trainer.stop();
            return Ok(());
        }
        self.load_current();
        self.play()
    }

    /// Drops the game and releases both the microphone and the output.
    pub fn end_game(&mut self) {
        self.trainer.shutdown();
        self.game.end_game();
        self.last_result = None;
    }

    pub fn set_level(&mut self, level: u32) {
        self.game.set_level(level);
    }

    pub fn set_instrument(&mut self, instrument: Instrument) {
        self.game.set_instrument(instrument);
    }

    pub fn current_question(&self) -> Option<&PitchQuestion> {
        self.game.current_question()
    }

    pub fn show_result(&self) -> bool {
        self.game.show_result()
    }

    pub fn is_game_complete(&self) -> bool {
        self.game.is_game_complete()
    }

    pub fn session(&self) -> Option<&PitchSessionRecord> {
        self.game.session()
    }

    pub fn game(&self) -> &GameSession {
        &self.game
    }

    pub fn trainer(&mut self) -> &mut PitchTrainer {
        &mut self.trainer
    }

    /// Feedback line for the result being shown.
    pub fn result_text(&self) -> Option<String> {
        let result = self.last_result?;
        let question = self.game.current_question()?;
        Some(result.describe(&question.target))
    }

    fn load_current(&mut self) {
        let Some(question) = self.game.current_question().copied() else {
            return;
        };
        let instrument = self
            .game
            .session()
            .map_or(self.game.selected_instrument(), |s| s.instrument);
        self.trainer.load_question(question.target, instrument);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioSink, OfflineOutput, OutputBackend};
    use crate::clock::ManualClock;
    use crate::tuning::PitchClass;
    use crossbeam_channel::{Receiver, Sender, unbounded};
    use parking_lot::Mutex;

    type Calls = Arc<Mutex<Vec<&'static str>>>;

    struct FakeListener {
        calls: Calls,
        estimates: Receiver<PitchEstimate>,
    }

    impl PitchListener for FakeListener {
        fn start_listening(&mut self) {
            self.calls.lock().push("start");
        }

        fn stop_listening(&mut self) {
            self.calls.lock().push("stop");
        }

        fn pause_listening(&mut self) {
            self.calls.lock().push("pause");
        }

        fn resume_listening(&mut self) {
            self.calls.lock().push("resume");
        }

        fn estimates(&self) -> &Receiver<PitchEstimate> {
            &self.estimates
        }

        fn status(&self) -> TrackerStatus {
            TrackerStatus::default()
        }
    }

    struct NoOutput;

    impl OutputBackend for NoOutput {
        fn open(&self) -> anyhow::Result<Box<dyn AudioSink>> {
            Err(anyhow::anyhow!("no output device"))
        }
    }

    struct Rig {
        clock: ManualClock,
        output: OfflineOutput,
        feed: Sender<PitchEstimate>,
        calls: Calls,
    }

    fn rig_with(backend: Option<Box<dyn OutputBackend>>) -> (PitchTrainer, Rig) {
        let config = TrainerConfig::default();
        let clock = ManualClock::new();
        let output = OfflineOutput::new(8000, config.playback.volume);
        let (feed, estimates) = unbounded();
        let calls = Calls::default();

        let backend = backend.unwrap_or_else(|| Box::new(output.clone()) as Box<dyn OutputBackend>);
        let transport = PlaybackTransport::new(backend, config.playback.clone());
        let listener = FakeListener {
            calls: Arc::clone(&calls),
            estimates,
        };
        let trainer = PitchTrainer::new(&config, transport, Box::new(listener), Arc::new(clock.clone()));
        (
            trainer,
            Rig {
                clock,
                output,
                feed,
                calls,
            },
        )
    }

    fn rig() -> (PitchTrainer, Rig) {
        rig_with(None)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn c4() -> Note {
        Note::new(PitchClass::C, 4)
    }

    fn a4() -> Note {
        Note::new(PitchClass::A, 4)
    }

    impl Rig {
        /// Feeds one frame every 16 ms from `from` to `to` inclusive, pumping
        /// after each, until something resolves.
        fn sing(
            &self,
            from: u64,
            to: u64,
            frequency: Option<f32>,
            mut pump: impl FnMut() -> Option<AttemptResult>,
        ) -> Option<AttemptResult> {
            let mut t = from;
            while t <= to {
                self.clock.set(ms(t));
                self.feed
                    .send(PitchEstimate {
                        frequency,
                        clarity: 0.95,
                        rms: 0.1,
                        at: ms(t),
                    })
                    .unwrap();
                if let Some(result) = pump() {
                    return Some(result);
                }
                t += 16;
            }
            None
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    #[test]
    fn steady_singing_locks_after_hold() {
        let (mut trainer, rig) = rig();
        trainer.load_question(c4(), Instrument::Piano);
        trainer.play().unwrap();
        assert_eq!(trainer.phase(), AttemptPhase::Listening);
        assert_eq!(rig.output.bus_ids().len(), 1);

        let result = rig.sing(0, 5000, Some(262.5), || trainer.pump()).unwrap();
        assert!(result.success);
        // Capture opens at 1200 ms and the hold needs 1000 ms on a 16 ms grid.
        assert_eq!(result.response_time, ms(2208));
        assert!((result.best_frequency.unwrap() - 262.5).abs() < 1e-3);
        assert!(result.best_cents_off.unwrap().abs() < 6.0);

        assert_eq!(trainer.phase(), AttemptPhase::Locked);
        assert_eq!(rig.calls(), ["start", "resume", "stop"]);
        assert_eq!(trainer.next_wakeup(), None);
    }

    #[test]
    fn flat_singing_fails_at_deadline_with_best_match() {
        let (mut trainer, rig) = rig();
        trainer.load_question(a4(), Instrument::Voice);
        trainer.play().unwrap();

        let result = rig.sing(0, 31_000, Some(415.3), || trainer.pump()).unwrap();
        assert!(!result.success);
        assert_eq!(result.response_time, ms(30_000));
        assert!((result.best_cents_off.unwrap() + 100.0).abs() < 0.1);
        assert_eq!(
            result.describe(&a4()),
            "100.0 cents below the target note (A4)"
        );
        assert_eq!(trainer.phase(), AttemptPhase::Failed);
    }

    #[test]
    fn deadline_fires_without_any_estimates() {
        let (mut trainer, rig) = rig();
        trainer.load_question(a4(), Instrument::Flute);
        trainer.play().unwrap();

        rig.clock.set(ms(29_999));
        assert!(trainer.pump().is_none());
        rig.clock.set(ms(30_000));
        let result = trainer.pump().unwrap();
        assert!(!result.success);
        assert_eq!(result.best_frequency, None);
        assert_eq!(rig.calls(), ["start", "resume", "stop"]);
    }

    #[test]
    fn replay_pauses_capture_but_keeps_deadline_and_best() {
        let (mut trainer, rig) = rig();
        trainer.load_question(c4(), Instrument::Piano);
        trainer.play().unwrap();

        assert!(rig.sing(1200, 1700, Some(262.5), || trainer.pump()).is_none());
        assert!(trainer.hold_progress() > 0.0);

        rig.clock.set(ms(1800));
        trainer.play().unwrap();
        assert_eq!(trainer.hold_progress(), 0.0);
        let attempt = *trainer.attempt().unwrap();
        assert_eq!(attempt.deadline_at, ms(30_000));
        assert!(attempt.best_cents_off.is_some());
        assert_eq!(rig.calls(), ["start", "resume", "pause"]);

        // Frames during the new listen delay do not count.
        assert!(rig.sing(1808, 2992, Some(262.5), || trainer.pump()).is_none());
        assert_eq!(trainer.hold_progress(), 0.0);

        let result = rig.sing(3008, 6000, Some(262.5), || trainer.pump()).unwrap();
        assert!(result.success);
        assert_eq!(result.response_time, ms(4016));
    }

    #[test]
    fn one_bad_frame_restarts_hold() {
        let (mut trainer, rig) = rig();
        trainer.load_question(c4(), Instrument::Piano);
        trainer.play().unwrap();

        let sharp = (c4().frequency() * 2f64.powf(40.0 / 1200.0)) as f32;
        assert!(rig.sing(1200, 1904, Some(262.0), || trainer.pump()).is_none());
        assert!(rig.sing(1920, 1920, Some(sharp), || trainer.pump()).is_none());
        assert_eq!(trainer.hold_progress(), 0.0);

        let result = rig.sing(1936, 5000, Some(262.0), || trainer.pump()).unwrap();
        assert_eq!(result.response_time, ms(2944));
    }

    #[test]
    fn replay_supersedes_previous_tone() {
        let (mut trainer, rig) = rig();
        trainer.load_question(c4(), Instrument::Violin);
        trainer.play().unwrap();
        rig.output.render_until(0.5);

        rig.clock.set(ms(500));
        trainer.play().unwrap();
        assert_eq!(rig.output.bus_ids().len(), 2);
        rig.output.render_until(0.6);
        assert_eq!(rig.output.bus_ids().len(), 1);
    }

    #[test]
    fn missing_output_reports_once_and_attempt_continues() {
        let (mut trainer, rig) = rig_with(Some(Box::new(NoOutput)));
        trainer.load_question(c4(), Instrument::Piano);

        assert!(matches!(trainer.play(), Err(EngineError::OutputUnavailable(_))));
        assert_eq!(trainer.phase(), AttemptPhase::Listening);

        rig.clock.set(ms(100));
        assert_eq!(trainer.play(), Ok(()));

        let result = rig.sing(1312, 4000, Some(262.0), || trainer.pump()).unwrap();
        assert!(result.success);
    }

    #[test]
    fn stop_cancels_timers_and_releases_tracker() {
        let (mut trainer, rig) = rig();
        trainer.load_question(c4(), Instrument::Guitar);
        trainer.play().unwrap();
        assert_eq!(trainer.next_wakeup(), Some(ms(1200)));

        trainer.stop();
        assert_eq!(trainer.phase(), AttemptPhase::Idle);
        assert_eq!(trainer.next_wakeup(), None);
        assert!(trainer.target().is_none());
        assert_eq!(rig.calls().last(), Some(&"stop"));

        rig.clock.set(ms(40_000));
        assert!(trainer.pump().is_none());
    }

    struct FixedQuestions(Vec<Note>);

    impl QuestionSource for FixedQuestions {
        fn generate(&mut self, _level: u32) -> Vec<PitchQuestion> {
            self.0
                .iter()
                .zip(1..)
                .map(|(&target, id)| PitchQuestion { id, target })
                .collect()
        }
    }

    #[derive(Default, Clone)]
    struct MemoryStore(Arc<Mutex<Vec<PitchSessionRecord>>>);

    impl SessionStore for MemoryStore {
        fn save(&mut self, session: &PitchSessionRecord) -> anyhow::Result<()> {
            self.0.lock().push(session.clone());
            Ok(())
        }
    }

    #[test]
    fn exercise_runs_a_full_game() {
        let (trainer, rig) = rig();
        let store = MemoryStore::default();
        let mut exercise = PitchExercise::new(
            trainer,
            Box::new(FixedQuestions(vec![c4(), a4()])),
            Box::new(store.clone()),
        );

        exercise.start_game(2, Instrument::Saxophone);
        assert_eq!(exercise.current_question().map(|q| q.id), Some(1));
        exercise.play().unwrap();

        let first = rig.sing(0, 5000, Some(262.5), || exercise.pump()).unwrap();
        assert!(first.success);
        assert!(exercise.show_result());
        assert!(exercise.result_text().unwrap().ends_with("above the target note (C4)"));
        assert!(store.0.lock().is_empty());

        // Replays are ignored while the result is shown.
        exercise.play().unwrap();
        assert_eq!(exercise.trainer().phase(), AttemptPhase::Locked);

        exercise.next_question().unwrap();
        assert!(!exercise.show_result());
        assert_eq!(exercise.current_question().map(|q| q.id), Some(2));
        assert_eq!(exercise.trainer().phase(), AttemptPhase::Listening);

        rig.clock.set(ms(2208 + 30_000));
        let second = exercise.pump().unwrap();
        assert!(!second.success);
        assert_eq!(exercise.result_text().as_deref(), Some("no clear pitch"));

        let saved = store.0.lock().clone();
        assert_eq!(saved.len(), 1);
        let record = &saved[0];
        assert_eq!(record.level, 2);
        assert_eq!(record.instrument, Instrument::Saxophone);
        assert_eq!(record.answers.len(), 2);
        assert!(record.answers[0].is_correct);
        assert_eq!(record.answers[0].response_time_ms, 2208);
        assert_eq!(record.answers[1].detected_frequency, None);
        assert_eq!(record.answers[1].response_time_ms, 30_000);

        exercise.next_question().unwrap();
        assert!(exercise.is_game_complete());
        assert_eq!(exercise.trainer().phase(), AttemptPhase::Idle);
        assert_eq!(rig.calls().last(), Some(&"stop"));

        assert!(exercise.trainer().transport().is_initialized());
        exercise.end_game();
        assert!(exercise.session().is_none());
        assert!(!exercise.trainer().transport().is_initialized());
        assert_eq!(store.0.lock().len(), 1);
    }

    #[test]
    fn shutdown_closes_output_until_next_play() {
        let (mut trainer, rig) = rig();
        trainer.load_question(c4(), Instrument::Piano);
        trainer.play().unwrap();
        assert!(trainer.transport().is_initialized());

        trainer.shutdown();
        assert!(!trainer.transport().is_initialized());
        assert_eq!(trainer.phase(), AttemptPhase::Idle);
        assert_eq!(rig.calls().last(), Some(&"stop"));

        trainer.load_question(c4(), Instrument::Piano);
        trainer.play().unwrap();
        assert!(trainer.transport().is_initialized());
    }
}

