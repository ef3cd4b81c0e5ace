//! Error types for rainloop-ap
//!
//! Initialization failures are returned to the caller. Steady-state failures
//! are absorbed by the rotation and only logged (see `playback::engine`).

use crate::playback::unit::UnitState;
use serde::Serialize;
use thiserror::Error;

/// An asset that failed to fetch or decode
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("failed to load '{locator}': {reason}")]
pub struct LoadError {
    /// Locator as given in the configuration
    pub locator: String,
    /// Human-readable failure reason
    pub reason: String,
}

impl LoadError {
    pub fn new(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            reason: reason.into(),
        }
    }
}

/// Main error type for rainloop-ap
#[derive(Error, Debug)]
pub enum Error {
    /// A single asset failed to load
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Every configured asset failed to load
    #[error("No playable assets ({} failed to load)", failures.len())]
    NoPlayableAssets { failures: Vec<LoadError> },

    /// A unit was asked to start while not free (scheduling bug)
    #[error("Playback unit {slot} is busy ({state:?})")]
    UnitBusy { slot: usize, state: UnitState },

    /// Host denied playback (device busy, stream refused to start)
    #[error("Playback rejected: {0}")]
    PlaybackRejected(String),

    /// Precision backend could not be constructed
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from the shared library
    #[error(transparent)]
    Common(#[from] rainloop_common::Error),

    /// The engine task is gone
    #[error("Engine is no longer running")]
    EngineClosed,
}

/// Convenience Result type using rainloop-ap Error
pub type Result<T> = std::result::Result<T, Error>;
