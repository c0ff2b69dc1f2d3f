//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when handling events and timestamps.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The timestamp string is not 24 (or bare NTP 16) hexadecimal digits.
    #[error("invalid NTP timestamp {0:?}: expected 24 hex digits")]
    InvalidTimestamp(String),

    /// The wall-clock time is before the NTP epoch.
    #[error("time before the NTP epoch: {0}")]
    TimestampOutOfRange(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
