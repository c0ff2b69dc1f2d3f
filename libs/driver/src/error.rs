//! Error types for platform drivers.

use std::time::Duration;

use platnet_id::{AttributeId, PortId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Call-level driver errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DriverError {
    /// The platform network is unreachable. Retryable.
    #[error("connection error: {0}")]
    Connection(String),

    /// A backend call did not complete within the configured timeout. Retryable.
    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The operation is not valid in the driver's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A prerequisite step has not been performed yet.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("unknown attribute: {0}")]
    UnknownAttribute(AttributeId),

    #[error("unknown port: {0}")]
    UnknownPort(PortId),

    #[error("attribute not writable: {0}")]
    NotWritable(AttributeId),

    #[error("invalid value for attribute {attr_id}: {reason}")]
    InvalidValue { attr_id: AttributeId, reason: String },

    /// The declared or discovered topology is malformed.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// The driver configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DriverError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_connection_error()
    }

    /// Returns true for unreachable-backend failures, timeouts included.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, DriverError::Connection(_) | DriverError::Timeout { .. })
    }

    pub(crate) fn activation_required() -> Self {
        DriverError::Precondition("activation required first".to_string())
    }

    pub(crate) fn destroyed() -> Self {
        DriverError::InvalidState("driver has been destroyed".to_string())
    }
}

/// Per-attribute failure inside a batch result.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum AttributeError {
    #[error("unknown attribute")]
    Unknown,

    #[error("attribute not writable")]
    NotWritable,

    #[error("invalid value: {reason}")]
    InvalidValue { reason: String },
}

impl AttributeError {
    /// Lifts a per-key error into a call-level error for `attr_id`.
    pub fn into_driver_error(self, attr_id: AttributeId) -> DriverError {
        match self {
            AttributeError::Unknown => DriverError::UnknownAttribute(attr_id),
            AttributeError::NotWritable => DriverError::NotWritable(attr_id),
            AttributeError::InvalidValue { reason } => DriverError::InvalidValue { attr_id, reason },
        }
    }
}

pub type Result<T, E = DriverError> = std::result::Result<T, E>;
