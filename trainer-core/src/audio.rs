//! # Audio Engine Module
//!
//! Explicit, injectable audio endpoints. Playback goes through an
//! [`OutputBackend`] that yields an [`AudioSink`]; microphone input goes
//! through a [`CaptureBackend`] that yields a [`CaptureSource`].
//!
//! ## Features
//! - CPAL output stream driving the bus [`Mixer`] from its callback
//! - Sample clock shared with the control side for frame-accurate scheduling
//! - CPAL input stream with down-mixing to mono and a sliding analysis window
//! - Offline output for rendering without a device
//!
//! CPAL streams are not `Send` on every platform, so each stream is built and
//! dropped on the thread that owns it.

use crate::mixer::{BusId, Mixer, MixerCommand};
use anyhow::{Result, anyhow};
use cpal::SupportedStreamConfigRange;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

/// Preferred device sample rate.
pub const TARGET_SAMPLE_RATE: u32 = 44100;

/// Capture chunks buffered between the input callback and the analyser.
const CAPTURE_QUEUE: usize = 64;

/// A running audio output.
pub trait AudioSink: Send {
    fn sample_rate(&self) -> u32;

    /// Frames rendered so far. This is the engine clock.
    fn current_frame(&self) -> u64;

    /// Makes sure the output is running.
    fn resume(&mut self) -> Result<()>;

    fn send(&self, command: MixerCommand) -> Result<()>;
}

/// Something that can open an audio output.
pub trait OutputBackend: Send {
    fn open(&self) -> Result<Box<dyn AudioSink>>;
}

/// A live input stream read one analysis window at a time.
pub trait CaptureSource {
    fn sample_rate(&self) -> u32;

    /// Fills `window` with the most recent samples, oldest first. When fewer
    /// samples have arrived than the window holds, the front is zero.
    fn read_window(&mut self, window: &mut [f32]);
}

/// Something that can open the microphone.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, window_size: usize) -> Result<Box<dyn CaptureSource>>;
}

/// Selects the configuration closest to `target_rate`, preferring fewer
/// channels, and returns it together with the rate to request.
///
/// # Arguments
/// * `configs` - Supported configuration ranges reported by the device
/// * `target_rate` - Desired sample rate in Hz
///
/// # Returns
/// * `Some((config, rate))` - Best f32 range and a rate inside it
/// * `None` - The device offers no f32 format
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<(SupportedStreamConfigRange, u32)> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .map(|c| {
            let rate = target_rate.clamp(c.min_sample_rate().0, c.max_sample_rate().0);
            (c, rate)
        })
        .min_by_key(|(c, rate)| (rate.abs_diff(target_rate), c.channels()))
}

enum StreamControl {
    Resume,
    Shutdown,
}

/// Default output device through CPAL.
#[derive(Debug, Clone)]
pub struct CpalOutput {
    volume: f32,
}

impl CpalOutput {
    pub fn new(volume: f32) -> Self {
        Self { volume }
    }
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new(0.7)
    }
}

impl OutputBackend for CpalOutput {
    fn open(&self) -> Result<Box<dyn AudioSink>> {
        let (command_tx, command_rx) = unbounded::<MixerCommand>();
        let (control_tx, control_rx) = unbounded::<StreamControl>();
        let (ready_tx, ready_rx) = bounded::<Result<u32, String>>(1);
        let frame = Arc::new(AtomicU64::new(0));

        let volume = self.volume;
        let callback_frame = Arc::clone(&frame);
        let thread = thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                let stream = match build_output_stream(command_rx, callback_frame, volume) {
                    Ok((stream, sample_rate)) => {
                        let _ = ready_tx.send(Ok(sample_rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("{e:#}")));
                        return;
                    }
                };

                for control in control_rx {
                    match control {
                        StreamControl::Resume => {
                            if let Err(e) = stream.play() {
                                log::error!(target: "audio", "Failed to resume output stream: {e}");
                            }
                        }
                        StreamControl::Shutdown => break,
                    }
                }
                log::debug!(target: "audio", "Output stream closed");
            })?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| anyhow!("Audio output thread exited during setup"))?
            .map_err(|e| anyhow!(e))?;

        Ok(Box::new(CpalSink {
            sample_rate,
            frame,
            commands: command_tx,
            control: control_tx,
            thread: Some(thread),
        }))
    }
}

fn build_output_stream(
    commands: Receiver<MixerCommand>,
    frame: Arc<AtomicU64>,
    volume: f32,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("No output device available"))?;

    log::info!(target: "audio", "Using audio output device: {}", device.name()?);

    let configs = device.supported_output_configs()?.collect::<Vec<_>>();
    let (supported, rate) = find_supported_config(configs, TARGET_SAMPLE_RATE)
        .ok_or_else(|| anyhow!("No suitable f32 output format found"))?;
    let config: cpal::StreamConfig = supported.with_sample_rate(cpal::SampleRate(rate)).into();
    let channels = config.channels as usize;

    log::info!(target: "audio", "Output at {rate} Hz, {channels} channel(s)");

    let mut mixer = Mixer::new(volume);
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            for command in commands.try_iter() {
                mixer.apply(command);
            }
            mixer.render(data, channels);
            frame.store(mixer.frame(), Ordering::Release);
        },
        |err| log::error!(target: "audio", "An error occurred on the output stream: {err}"),
        None,
    )?;

    stream.play()?;
    Ok((stream, rate))
}

struct CpalSink {
    sample_rate: u32,
    frame: Arc<AtomicU64>,
    commands: Sender<MixerCommand>,
    control: Sender<StreamControl>,
    thread: Option<JoinHandle<()>>,
}

impl AudioSink for CpalSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    fn resume(&mut self) -> Result<()> {
        self.control
            .send(StreamControl::Resume)
            .map_err(|_| anyhow!("Audio output thread is gone"))
    }

    fn send(&self, command: MixerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("Audio output thread is gone"))
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        let _ = self.control.send(StreamControl::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Default input device through CPAL.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalCapture;

impl CaptureBackend for CpalCapture {
    fn open(&self, window_size: usize) -> Result<Box<dyn CaptureSource>> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("No input device available"))?;

        log::info!(target: "audio", "Using audio input device: {}", device.name()?);

        let configs = device.supported_input_configs()?.collect::<Vec<_>>();
        let (supported, rate) = find_supported_config(configs, TARGET_SAMPLE_RATE)
            .ok_or_else(|| anyhow!("No suitable f32 input format found"))?;
        let config: cpal::StreamConfig = supported.with_sample_rate(cpal::SampleRate(rate)).into();
        let channels = config.channels.max(1) as usize;

        let (sender, receiver) = bounded::<Vec<f32>>(CAPTURE_QUEUE);
        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                    .collect();
                // Dropping a chunk when the analyser lags is fine; it only
                // ever looks at the newest window.
                let _ = sender.try_send(mono);
            },
            |err| log::error!(target: "audio", "An error occurred on the input stream: {err}"),
            None,
        )?;
        stream.play()?;

        log::info!(target: "audio", "Capturing at {rate} Hz, {channels} channel(s) mixed to mono");

        Ok(Box::new(CpalCaptureSource {
            _stream: stream,
            chunks: receiver,
            history: SampleWindow::new(window_size),
            sample_rate: rate,
        }))
    }
}

/// Keeps the most recent `capacity` samples.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn extend(&mut self, chunk: &[f32]) {
        let chunk = &chunk[chunk.len().saturating_sub(self.capacity)..];
        let overflow = (self.samples.len() + chunk.len()).saturating_sub(self.capacity);
        self.samples.drain(..overflow);
        self.samples.extend(chunk);
    }

    /// Copies the window into `out`, right-aligned.
    pub fn copy_to(&self, out: &mut [f32]) {
        let available = self.samples.len().min(out.len());
        let pad = out.len() - available;
        out[..pad].fill(0.0);
        let skip = self.samples.len() - available;
        for (dst, src) in out[pad..].iter_mut().zip(self.samples.iter().skip(skip)) {
            *dst = *src;
        }
    }
}

struct CpalCaptureSource {
    _stream: cpal::Stream,
    chunks: Receiver<Vec<f32>>,
    history: SampleWindow,
    sample_rate: u32,
}

impl CaptureSource for CpalCaptureSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_window(&mut self, window: &mut [f32]) {
        for chunk in self.chunks.try_iter() {
            self.history.extend(&chunk);
        }
        self.history.copy_to(window);
    }
}

/// Output that renders into memory on demand.
///
/// Clones share the same mixer, so a test can keep one handle while the
/// transport owns the backend.
#[derive(Clone)]
pub struct OfflineOutput {
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
}

impl OfflineOutput {
    pub fn new(sample_rate: u32, volume: f32) -> Self {
        Self {
            sample_rate,
            mixer: Arc::new(Mutex::new(Mixer::new(volume))),
        }
    }

    /// Renders `frames` mono frames and advances the engine clock.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        self.mixer.lock().render(&mut out, 1);
        out
    }

    /// Renders until the engine clock reaches `seconds`.
    pub fn render_until(&self, seconds: f64) -> Vec<f32> {
        let target = (seconds * self.sample_rate as f64).round() as u64;
        let current = self.mixer.lock().frame();
        self.render(target.saturating_sub(current) as usize)
    }

    pub fn bus_ids(&self) -> Vec<BusId> {
        self.mixer.lock().bus_ids()
    }

    pub fn volume(&self) -> f32 {
        self.mixer.lock().volume()
    }
}

impl OutputBackend for OfflineOutput {
    fn open(&self) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(OfflineSink {
            sample_rate: self.sample_rate,
            mixer: Arc::clone(&self.mixer),
        }))
    }
}

/// The sink side of [`OfflineOutput`].
pub struct OfflineSink {
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
}

impl AudioSink for OfflineSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_frame(&self) -> u64 {
        self.mixer.lock().frame()
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn send(&self, command: MixerCommand) -> Result<()> {
        self.mixer.lock().apply(command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::PendingBus;

    #[test]
    fn window_keeps_latest_samples() {
        let mut window = SampleWindow::new(4);
        window.extend(&[1.0, 2.0, 3.0]);
        window.extend(&[4.0, 5.0]);
        let mut out = [0.0; 4];
        window.copy_to(&mut out);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0]);

        window.extend(&[6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
        window.copy_to(&mut out);
        assert_eq!(out, [8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn short_history_is_zero_padded() {
        let mut window = SampleWindow::new(8);
        window.extend(&[0.5, 0.25]);
        let mut out = [1.0; 4];
        window.copy_to(&mut out);
        assert_eq!(out, [0.0, 0.0, 0.5, 0.25]);
    }

    #[test]
    fn offline_sink_shares_mixer_clock() {
        let output = OfflineOutput::new(8000, 1.0);
        let sink = output.open().unwrap();
        sink.send(MixerCommand::Attach(PendingBus::new(3, 1.0, 100))).unwrap();
        assert_eq!(output.bus_ids(), vec![3]);

        output.render(40);
        assert_eq!(sink.current_frame(), 40);
        output.render_until(0.0125);
        assert_eq!(sink.current_frame(), 100);
        assert!(output.bus_ids().is_empty());
    }
}
