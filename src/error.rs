//! Unified error handling for the run-tracking engine.
//!
//! Every fallible engine operation returns [`Result`]. Sensor outliers are
//! deliberately absent from this taxonomy: rejected fixes are filtered and
//! counted in [`RunStats::outlier_count`](crate::RunStats), never surfaced.

use thiserror::Error;

use crate::{RunCommand, RunPhase};

/// Unified error type for run-tracking operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunTrackError {
    /// Location access not granted. Fatal to `start()`, never retried.
    #[error("Location permission denied (foreground: {foreground}, background: {background})")]
    PermissionDenied { foreground: bool, background: bool },

    /// A lifecycle command was issued from a phase that does not accept it.
    #[error("Cannot {command} while {phase}")]
    InvalidTransition { command: RunCommand, phase: RunPhase },

    /// Storage returned data that could not be decoded as a run envelope.
    #[error("Corrupt persisted run state: {message}")]
    CorruptPersistedState { message: String },

    /// Underlying key-value storage failed or was closed.
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Encoding the run envelope failed
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// The location provider refused or failed the subscription.
    #[error("Location sampler error: {message}")]
    Sampler { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl RunTrackError {
    pub(crate) fn storage(message: impl Into<String>) -> Self {
        RunTrackError::Storage {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        RunTrackError::Config {
            message: message.into(),
        }
    }

    /// True for errors the caller should treat as "nothing happened".
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, RunTrackError::InvalidTransition { .. })
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for RunTrackError {
    fn from(err: rusqlite::Error) -> Self {
        RunTrackError::storage(err.to_string())
    }
}

/// Result type alias for run-tracking operations.
pub type Result<T> = std::result::Result<T, RunTrackError>;
