//! Error types for process supervision.
//!
//! Every failure that concerns a single managed process is expressed as a
//! [`ProcessError`]. These errors stay inside the owning supervisor's state
//! machine; only configuration errors are surfaced to the operator.

use thiserror::Error;

use crate::types::ByteSize;

/// Process-specific error types for process supervision.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    #[error("Process not found: {id}")]
    NotFound { id: String },

    #[error("Process spawn failed: {id} - {reason}")]
    SpawnFailed { id: String, reason: String },

    #[error("Process stop failed: {id} - {reason}")]
    StopFailed { id: String, reason: String },

    #[error("Process timeout: {id} - {operation}")]
    Timeout { id: String, operation: String },

    #[error("Process state error: {id} - expected {expected}, got {actual}")]
    InvalidState {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Process configuration error: {id} - {reason}")]
    Configuration { id: String, reason: String },

    #[error("Process memory limit exceeded: {id} - resident {resident} over ceiling {ceiling}")]
    MemoryLimitExceeded {
        id: String,
        resident: ByteSize,
        ceiling: ByteSize,
    },

    #[error("Process exceeded maximum restarts: {id} - {restarts} consecutive restarts (max {max_restarts})")]
    MaxRestartsExceeded {
        id: String,
        restarts: u32,
        max_restarts: u32,
    },

    #[error("Process monitoring error: {id} - {reason}")]
    MonitoringError { id: String, reason: String },
}

impl ProcessError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn spawn_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn stop_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StopFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Timeout {
            id: id.into(),
            operation: operation.into(),
        }
    }

    pub fn invalid_state(
        id: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn configuration(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn memory_limit_exceeded(id: impl Into<String>, resident: ByteSize, ceiling: ByteSize) -> Self {
        Self::MemoryLimitExceeded {
            id: id.into(),
            resident,
            ceiling,
        }
    }

    pub fn max_restarts_exceeded(id: impl Into<String>, restarts: u32, max_restarts: u32) -> Self {
        Self::MaxRestartsExceeded {
            id: id.into(),
            restarts,
            max_restarts,
        }
    }

    pub fn monitoring(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MonitoringError {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for process operations.
pub type ProcessResult<T> = std::result::Result<T, ProcessError>;
