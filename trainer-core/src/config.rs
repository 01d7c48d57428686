//! # Trainer Configuration
//!
//! Tunable constants for the attempt controller, the pitch tracker and the
//! playback transport, loadable from JSON. Any key left out of the file keeps
//! its default, so an empty object `{}` is a valid configuration.

use crate::error::EngineError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub attempt: AttemptConfig,
    pub tracker: TrackerConfig,
    pub playback: PlaybackConfig,
}

/// Hold-to-lock scoring parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptConfig {
    pub tolerance_cents: f64,
    pub hold_ms: u64,
    /// Pause between triggering the target tone and opening the microphone.
    pub listen_delay_ms: u64,
    pub max_attempt_ms: u64,
    /// Length of the target note played at the start of an attempt.
    pub note_duration_secs: f64,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            tolerance_cents: 25.0,
            hold_ms: 1000,
            listen_delay_ms: 1200,
            max_attempt_ms: 30_000,
            note_duration_secs: 1.1,
        }
    }
}

impl AttemptConfig {
    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    pub fn listen_delay(&self) -> Duration {
        Duration::from_millis(self.listen_delay_ms)
    }

    pub fn max_attempt(&self) -> Duration {
        Duration::from_millis(self.max_attempt_ms)
    }
}

/// Gating and smoothing of the per-frame pitch estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub min_clarity: f32,
    pub min_frequency: f32,
    pub max_frequency: f32,
    pub smoothing: f32,
    pub fallback_ms: u64,
    pub window_size: usize,
    pub frame_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_clarity: 0.7,
            min_frequency: 65.0,
            max_frequency: 1200.0,
            smoothing: 0.18,
            fallback_ms: 1200,
            window_size: 2048,
            frame_interval_ms: 16,
        }
    }
}

impl TrackerConfig {
    pub fn fallback(&self) -> Duration {
        Duration::from_millis(self.fallback_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub volume: f32,
    pub fade_ms: u64,
    /// Bus lifetime is `ceil(total * tail_factor)` plus `tail_padding_ms`.
    pub tail_factor: f64,
    pub tail_padding_ms: u64,
    pub interval_note_secs: f64,
    pub interval_gap_secs: f64,
    pub scale_note_secs: f64,
    pub scale_gap_secs: f64,
    pub chord_duration_secs: f64,
    pub reference_duration_secs: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            volume: 0.7,
            fade_ms: 20,
            tail_factor: 1.8,
            tail_padding_ms: 150,
            interval_note_secs: 1.0,
            interval_gap_secs: 0.1,
            scale_note_secs: 0.55,
            scale_gap_secs: 0.05,
            chord_duration_secs: 1.2,
            reference_duration_secs: 1.1,
        }
    }
}

impl TrainerConfig {
    /// Parses a configuration from JSON text and validates it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TrainerConfig =
            serde_json::from_str(json).context("Failed to parse trainer configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    ///
    /// # Arguments
    /// * `path` - Path to a JSON file
    ///
    /// # Returns
    /// * `Ok(config)` - Parsed and validated configuration
    /// * `Err(e)` - If the file cannot be read, parsed or validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&json)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write config file {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: &str| Err(EngineError::InvalidConfig(msg.to_string()));

        let a = &self.attempt;
        if !(a.tolerance_cents > 0.0) {
            return invalid("attempt.tolerance_cents must be positive");
        }
        if a.hold_ms == 0 || a.max_attempt_ms == 0 {
            return invalid("attempt durations must be positive");
        }
        if !(a.note_duration_secs > 0.0) {
            return invalid("attempt.note_duration_secs must be positive");
        }

        let t = &self.tracker;
        if !(t.min_frequency < t.max_frequency) {
            return invalid("tracker.min_frequency must be below tracker.max_frequency");
        }
        if !(t.smoothing > 0.0 && t.smoothing <= 1.0) {
            return invalid("tracker.smoothing must be in (0, 1]");
        }
        if t.window_size < 64 || t.frame_interval_ms == 0 || t.fallback_ms == 0 {
            return invalid("tracker window and intervals must be positive");
        }

        let p = &self.playback;
        if !(0.0..=1.0).contains(&p.volume) {
            return invalid("playback.volume must be within 0..=1");
        }
        let durations = [
            p.interval_note_secs,
            p.scale_note_secs,
            p.chord_duration_secs,
            p.reference_duration_secs,
            p.tail_factor,
        ];
        if durations.iter().any(|d| !(*d > 0.0)) || p.fade_ms == 0 {
            return invalid("playback durations must be positive");
        }
        if p.interval_gap_secs < 0.0 || p.scale_gap_secs < 0.0 {
            return invalid("playback gaps cannot be negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = TrainerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, TrainerConfig::default());
        assert_eq!(config.attempt.tolerance_cents, 25.0);
        assert_eq!(config.tracker.window_size, 2048);
        assert_eq!(config.playback.volume, 0.7);
    }

    #[test]
    fn partial_groups_keep_other_defaults() {
        let config =
            TrainerConfig::from_json_str(r#"{"attempt":{"hold_ms":500},"tracker":{"smoothing":0.5}}"#)
                .unwrap();
        assert_eq!(config.attempt.hold(), Duration::from_millis(500));
        assert_eq!(config.attempt.max_attempt_ms, 30_000);
        assert_eq!(config.tracker.smoothing, 0.5);
        assert_eq!(config.tracker.min_clarity, 0.7);
    }

    #[test]
    fn rejects_inverted_frequency_range() {
        let err = TrainerConfig::from_json_str(
            r#"{"tracker":{"min_frequency":1500,"max_frequency":1200}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }

    #[test]
    fn rejects_non_positive_tolerance() {
        let mut config = TrainerConfig::default();
        config.attempt.tolerance_cents = 0.0;
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn save_then_load() {
        let path = std::env::temp_dir().join(format!("trainer-config-{}.json", std::process::id()));
        let mut config = TrainerConfig::default();
        config.playback.volume = 0.4;
        config.save(&path).unwrap();
        let loaded = TrainerConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, config);
    }
}
