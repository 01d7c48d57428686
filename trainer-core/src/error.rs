//! Errors surfaced to callers of the engine.
//!
//! Device plumbing reports through `anyhow`; these variants are what the
//! public operations return once a failure has a meaning for the caller.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The audio output could not be opened.
    #[error("audio output unavailable: {0}")]
    OutputUnavailable(String),

    /// Microphone access was denied or no input device exists.
    #[error("microphone unavailable: {0}")]
    MicrophoneUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
