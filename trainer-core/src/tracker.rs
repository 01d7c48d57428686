//! # Pitch Tracker Module
//!
//! Owns the microphone between `start_listening` and `stop_listening` and
//! turns it into a time-ordered stream of [`PitchEstimate`]s.
//!
//! ## Features
//! - Dedicated analysis thread with a fixed frame interval
//! - Clarity and frequency-range gating of raw candidates
//! - Exponential smoothing with a fallback window that bridges short dropouts
//! - Pause/resume without releasing the input stream
//! - Live [`TrackerStatus`] readable from any thread

use crate::PitchEstimate;
use crate::audio::{CaptureBackend, CaptureSource};
use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::EngineError;
use crate::pitch::{self, McLeodDetector, PitchCandidate};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Estimates held for a consumer that is not draining them, about four
/// seconds of frames at the default interval. Newer frames are dropped once
/// it is full.
pub const ESTIMATE_QUEUE: usize = 256;

/// Lifecycle of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerState {
    #[default]
    Idle,
    /// Waiting for the microphone to open.
    Requesting,
    Listening,
    /// The microphone could not be opened. Not retried automatically.
    Error,
}

/// Snapshot of what the tracker currently exposes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackerStatus {
    pub state: TrackerState,
    pub frequency: Option<f32>,
    pub clarity: f32,
    pub rms: f32,
    pub is_paused: bool,
    pub error_message: Option<String>,
}

impl TrackerStatus {
    /// The capture failure as an engine error, while the tracker is in the
    /// error state.
    pub fn error(&self) -> Option<EngineError> {
        if self.state != TrackerState::Error {
            return None;
        }
        let message = self.error_message.clone().unwrap_or_default();
        Some(EngineError::MicrophoneUnavailable(message))
    }
}

/// The operations the attempt controller needs from a pitch source.
pub trait PitchListener: Send {
    /// Opens the microphone and begins analysis. Ignored while already
    /// requesting or listening.
    fn start_listening(&mut self);

    /// Releases the microphone and returns to idle. Safe to call repeatedly.
    fn stop_listening(&mut self);

    fn pause_listening(&mut self);

    /// Resumes estimates and re-arms the fallback window.
    fn resume_listening(&mut self);

    /// One estimate per analysis frame, in time order.
    fn estimates(&self) -> &Receiver<PitchEstimate>;

    fn status(&self) -> TrackerStatus;
}

/// Gates raw candidates and keeps the smoothed frequency.
#[derive(Debug, Clone)]
pub struct PitchSmoother {
    config: TrackerConfig,
    smoothed: Option<f32>,
    last_valid: Duration,
}

impl PitchSmoother {
    pub fn new(config: TrackerConfig, now: Duration) -> Self {
        Self {
            config,
            smoothed: None,
            last_valid: now,
        }
    }

    pub fn is_valid(&self, candidate: &PitchCandidate) -> bool {
        candidate.clarity >= self.config.min_clarity
            && candidate.frequency >= self.config.min_frequency
            && candidate.frequency <= self.config.max_frequency
    }

    /// Feeds one frame's candidate and returns the frequency to report.
    ///
    /// A valid candidate moves the smoothed value by `smoothing` of the gap.
    /// An invalid one keeps reporting the smoothed value until `fallback`
    /// has passed since the last valid candidate, then reports `None`.
    pub fn update(&mut self, candidate: PitchCandidate, now: Duration) -> Option<f32> {
        if self.is_valid(&candidate) {
            let previous = self.smoothed.unwrap_or(candidate.frequency);
            let next = previous + (candidate.frequency - previous) * self.config.smoothing;
            self.smoothed = Some(next);
            self.last_valid = now;
            return Some(next);
        }

        if now.saturating_sub(self.last_valid) > self.config.fallback() {
            None
        } else {
            self.smoothed
        }
    }

    /// Treats `now` as the last valid frame.
    pub fn rearm(&mut self, now: Duration) {
        self.last_valid = now;
    }

    pub fn smoothed(&self) -> Option<f32> {
        self.smoothed
    }
}

/// Per-frame analysis: window read, RMS, pitch candidate, smoothing.
pub struct FrameAnalyzer {
    detector: McLeodDetector,
    window: Vec<f32>,
    smoother: PitchSmoother,
}

impl FrameAnalyzer {
    pub fn new(config: TrackerConfig, now: Duration) -> Self {
        let window_size = config.window_size;
        Self {
            detector: McLeodDetector::new(window_size),
            window: vec![0.0; window_size],
            smoother: PitchSmoother::new(config, now),
        }
    }

    pub fn rearm(&mut self, now: Duration) {
        self.smoother.rearm(now);
    }

    /// Analyses the newest window. While paused the window is still read
    /// but the frame reports no pitch and zero levels.
    pub fn analyze(&mut self, source: &mut dyn CaptureSource, paused: bool, now: Duration) -> PitchEstimate {
        source.read_window(&mut self.window);
        if paused {
            return PitchEstimate::silent(now);
        }

        let rms = pitch::rms(&self.window);
        let candidate = self.detector.find_pitch(&self.window, source.sample_rate());
        PitchEstimate {
            frequency: self.smoother.update(candidate, now),
            clarity: candidate.clarity,
            rms,
            at: now,
        }
    }
}

struct Shared {
    status: Mutex<TrackerStatus>,
    paused: AtomicBool,
    rearm: AtomicBool,
}

struct Worker {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Microphone-backed [`PitchListener`].
pub struct PitchTracker {
    backend: Arc<dyn CaptureBackend>,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
    shared: Arc<Shared>,
    estimates_tx: Sender<PitchEstimate>,
    estimates_rx: Receiver<PitchEstimate>,
    worker: Option<Worker>,
}

impl PitchTracker {
    pub fn new(backend: Arc<dyn CaptureBackend>, clock: Arc<dyn Clock>, config: TrackerConfig) -> Self {
        let (estimates_tx, estimates_rx) = bounded(ESTIMATE_QUEUE);
        Self {
            backend,
            clock,
            config,
            shared: Arc::new(Shared {
                status: Mutex::new(TrackerStatus::default()),
                paused: AtomicBool::new(false),
                rearm: AtomicBool::new(false),
            }),
            estimates_tx,
            estimates_rx,
            worker: None,
        }
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(());
            if worker.handle.join().is_err() {
                log::error!(target: "tracker", "Analysis thread panicked");
            }
        }
    }
}

impl PitchListener for PitchTracker {
    fn start_listening(&mut self) {
        {
            let mut status = self.shared.status.lock();
            if matches!(status.state, TrackerState::Requesting | TrackerState::Listening) {
                log::debug!(target: "tracker", "start ignored while {:?}", status.state);
                return;
            }
            status.state = TrackerState::Requesting;
            status.error_message = None;
        }

        // A previous worker can only be one that failed to open the device.
        self.join_worker();

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let backend = Arc::clone(&self.backend);
        let clock = Arc::clone(&self.clock);
        let shared = Arc::clone(&self.shared);
        let estimates = self.estimates_tx.clone();
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name("pitch-tracker".into())
            .spawn(move || run_analysis(backend, clock, config, shared, estimates, shutdown_rx));

        match spawned {
            Ok(handle) => {
                self.worker = Some(Worker {
                    shutdown: shutdown_tx,
                    handle,
                })
            }
            Err(e) => {
                log::error!(target: "tracker", "Failed to spawn analysis thread: {e}");
                let mut status = self.shared.status.lock();
                status.state = TrackerState::Error;
                status.error_message = Some(e.to_string());
            }
        }
    }

    fn stop_listening(&mut self) {
        self.join_worker();
        while self.estimates_rx.try_recv().is_ok() {}

        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.rearm.store(false, Ordering::SeqCst);
        let mut status = self.shared.status.lock();
        if status.state != TrackerState::Idle {
            log::info!(target: "tracker", "Stopped listening");
        }
        // The last error message stays visible until the next start.
        let error_message = status.error_message.take();
        *status = TrackerStatus {
            error_message,
            ..TrackerStatus::default()
        };
    }

    fn pause_listening(&mut self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.status.lock().is_paused = true;
    }

    fn resume_listening(&mut self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.rearm.store(true, Ordering::SeqCst);
        self.shared.status.lock().is_paused = false;
    }

    fn estimates(&self) -> &Receiver<PitchEstimate> {
        &self.estimates_rx
    }

    fn status(&self) -> TrackerStatus {
        self.shared.status.lock().clone()
    }
}

impl Drop for PitchTracker {
    fn drop(&mut self) {
        self.join_worker();
    }
}

fn run_analysis(
    backend: Arc<dyn CaptureBackend>,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
    shared: Arc<Shared>,
    estimates: Sender<PitchEstimate>,
    shutdown: Receiver<()>,
) {
    let mut source = match backend.open(config.window_size) {
        Ok(source) => source,
        Err(e) => {
            let message = format!("{e:#}");
            log::error!(target: "tracker", "Failed to start pitch detection: {message}");
            let mut status = shared.status.lock();
            status.state = TrackerState::Error;
            status.error_message = Some(message);
            return;
        }
    };

    log::info!(target: "tracker", "Listening at {} Hz", source.sample_rate());
    shared.status.lock().state = TrackerState::Listening;

    let interval = config.frame_interval();
    let mut analyzer = FrameAnalyzer::new(config, clock.now());

    loop {
        select! {
            recv(shutdown) -> _ => break,
            default(interval) => {}
        }

        let now = clock.now();
        if shared.rearm.swap(false, Ordering::SeqCst) {
            analyzer.rearm(now);
        }
        let paused = shared.paused.load(Ordering::SeqCst);
        let estimate = analyzer.analyze(source.as_mut(), paused, now);

        {
            let mut status = shared.status.lock();
            status.frequency = estimate.frequency;
            status.clarity = estimate.clarity;
            status.rms = estimate.rms;
        }
        match estimates.try_send(estimate) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    log::debug!(target: "tracker", "Analysis thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn config() -> TrackerConfig {
        TrackerConfig::default()
    }

    fn valid(frequency: f32) -> PitchCandidate {
        PitchCandidate {
            frequency,
            clarity: 0.95,
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn first_valid_candidate_initialises_smoothing() {
        let mut smoother = PitchSmoother::new(config(), ms(0));
        assert_eq!(smoother.update(valid(220.0), ms(16)), Some(220.0));
        let next = smoother.update(valid(230.0), ms(32)).unwrap();
        assert!((next - 221.8).abs() < 1e-4);
    }

    #[test]
    fn gate_rejects_low_clarity_and_out_of_range() {
        let smoother = PitchSmoother::new(config(), ms(0));
        assert!(!smoother.is_valid(&PitchCandidate {
            frequency: 220.0,
            clarity: 0.69
        }));
        assert!(!smoother.is_valid(&valid(64.9)));
        assert!(!smoother.is_valid(&valid(1200.1)));
        assert!(smoother.is_valid(&valid(65.0)));
        assert!(smoother.is_valid(&valid(1200.0)));
    }

    #[test]
    fn dropout_is_bridged_until_fallback() {
        let mut smoother = PitchSmoother::new(config(), ms(0));
        smoother.update(valid(300.0), ms(0));
        let noise = PitchCandidate::default();
        assert_eq!(smoother.update(noise, ms(1200)), Some(300.0));
        assert_eq!(smoother.update(noise, ms(1201)), None);

        // Smoothing continues from the retained value afterwards.
        let resumed = smoother.update(valid(400.0), ms(1300)).unwrap();
        assert!((resumed - 318.0).abs() < 1e-3);
    }

    #[test]
    fn rearm_restarts_fallback_window() {
        let mut smoother = PitchSmoother::new(config(), ms(0));
        smoother.update(valid(300.0), ms(0));
        smoother.rearm(ms(5000));
        assert_eq!(smoother.update(PitchCandidate::default(), ms(5100)), Some(300.0));
    }

    #[test]
    fn smoothing_converges_monotonically() {
        let mut smoother = PitchSmoother::new(config(), ms(0));
        smoother.update(valid(200.0), ms(0));
        let target = 250.0;
        let mut previous = 200.0;
        let mut frames = 0;
        for frame in 1..200u64 {
            let value = smoother.update(valid(target), ms(frame * 16)).unwrap();
            assert!(value >= previous && value <= target);
            previous = value;
            if (target - value).abs() < 0.5 {
                frames = frame;
                break;
            }
        }
        assert!(frames > 0 && frames < 40, "settled after {frames} frames");
    }

    struct SineSource {
        frequency: f32,
        position: u64,
    }

    impl CaptureSource for SineSource {
        fn sample_rate(&self) -> u32 {
            44100
        }

        fn read_window(&mut self, window: &mut [f32]) {
            for sample in window.iter_mut() {
                let t = self.position as f32 / 44100.0;
                *sample = 0.3 * (std::f32::consts::TAU * self.frequency * t).sin();
                self.position += 1;
            }
        }
    }

    #[test]
    fn paused_frames_report_nothing() {
        let mut analyzer = FrameAnalyzer::new(config(), ms(0));
        let mut source = SineSource {
            frequency: 220.0,
            position: 0,
        };
        let paused = analyzer.analyze(&mut source, true, ms(16));
        assert_eq!(paused, PitchEstimate::silent(ms(16)));

        let live = analyzer.analyze(&mut source, false, ms(32));
        let frequency = live.frequency.unwrap();
        assert!((frequency - 220.0).abs() < 1.0);
        assert!(live.clarity > 0.9);
        assert!(live.rms > 0.2);
    }

    struct SineBackend(f32);

    impl CaptureBackend for SineBackend {
        fn open(&self, _window_size: usize) -> anyhow::Result<Box<dyn CaptureSource>> {
            Ok(Box::new(SineSource {
                frequency: self.0,
                position: 0,
            }))
        }
    }

    struct NoMicrophone;

    impl CaptureBackend for NoMicrophone {
        fn open(&self, _window_size: usize) -> anyhow::Result<Box<dyn CaptureSource>> {
            Err(anyhow::anyhow!("permission denied"))
        }
    }

    fn tracker(backend: impl CaptureBackend + 'static) -> PitchTracker {
        PitchTracker::new(Arc::new(backend), Arc::new(SystemClock::new()), config())
    }

    fn wait_for_state(tracker: &PitchTracker, state: TrackerState) -> bool {
        (0..200).any(|_| {
            if tracker.status().state == state {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
            false
        })
    }

    #[test]
    fn tracker_streams_estimates_from_device() {
        let mut tracker = tracker(SineBackend(330.0));
        tracker.start_listening();
        assert!(wait_for_state(&tracker, TrackerState::Listening));

        let estimate = (0..50)
            .filter_map(|_| tracker.estimates().recv_timeout(Duration::from_secs(1)).ok())
            .find(|e| e.frequency.is_some())
            .expect("no pitched frame");
        assert!((estimate.frequency.unwrap() - 330.0).abs() < 2.0);

        tracker.pause_listening();
        assert!(tracker.status().is_paused);
        tracker.resume_listening();
        assert!(!tracker.status().is_paused);

        tracker.stop_listening();
        let status = tracker.status();
        assert_eq!(status.state, TrackerState::Idle);
        assert_eq!(status.frequency, None);
        assert!(tracker.estimates().try_recv().is_err());
    }

    #[test]
    fn failed_open_reports_error_until_restart() {
        let mut tracker = tracker(NoMicrophone);
        tracker.start_listening();
        assert!(wait_for_state(&tracker, TrackerState::Error));
        assert_eq!(tracker.status().error_message.as_deref(), Some("permission denied"));
        assert_eq!(
            tracker.status().error(),
            Some(EngineError::MicrophoneUnavailable("permission denied".into()))
        );

        tracker.stop_listening();
        let status = tracker.status();
        assert_eq!(status.state, TrackerState::Idle);
        assert_eq!(status.error_message.as_deref(), Some("permission denied"));
        assert_eq!(status.error(), None);

        tracker.start_listening();
        assert!(wait_for_state(&tracker, TrackerState::Error));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut tracker = tracker(SineBackend(220.0));
        tracker.stop_listening();
        tracker.stop_listening();
        assert_eq!(tracker.status(), TrackerStatus::default());
    }

    #[test]
    fn undrained_estimates_stay_bounded() {
        let config = TrackerConfig {
            frame_interval_ms: 1,
            ..config()
        };
        let mut tracker = PitchTracker::new(Arc::new(SineBackend(220.0)), Arc::new(SystemClock::new()), config);
        tracker.start_listening();
        assert!(wait_for_state(&tracker, TrackerState::Listening));

        let filled = (0..1000).any(|_| {
            if tracker.estimates().len() == ESTIMATE_QUEUE {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
            false
        });
        assert!(filled, "queue never filled");

        thread::sleep(Duration::from_millis(50));
        assert_eq!(tracker.estimates().len(), ESTIMATE_QUEUE);
        let status = tracker.status();
        assert_eq!(status.state, TrackerState::Listening);
        assert!(status.frequency.is_some(), "status keeps updating");

        tracker.stop_listening();
        assert!(tracker.estimates().is_empty());
    }
}
