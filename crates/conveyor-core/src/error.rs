//! Error types for the queue runtime

use serde::{Deserialize, Serialize};

/// Result type used throughout the queue runtime
pub type QueueResult<T> = Result<T, QueueError>;

/// Error types for queue processing
///
/// Variants carry message strings rather than source errors so that a failure
/// can be cloned into job state and persisted alongside dead-lettered jobs.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum QueueError {
    #[error("Job type already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Unknown job type: {0}")]
    UnknownType(String),

    #[error("Serialized job is missing the 'type' field")]
    MissingType,

    #[error("Failed to deserialize job '{job_type}': {reason}")]
    DeserializationFailure { job_type: String, reason: String },

    #[error("Driver not found: {0}")]
    DriverNotFound(String),

    #[error("Driver already registered: {0}")]
    DriverAlreadyRegistered(String),

    #[error("No default driver configured")]
    NoDefaultDriver,

    #[error("Driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("Job timed out after {0}ms")]
    TimeoutMillis(u64),

    #[error("Job execution failed: {0}")]
    Handler(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Middleware not found: {0}")]
    MiddlewareNotFound(String),
}

impl QueueError {
    /// Shortcut for handler failures from arbitrary error values.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        QueueError::Handler(err.to_string())
    }

    /// Whether this error represents a handler timeout.
    ///
    /// Timeouts are counted separately from other failures in metrics.
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueueError::TimeoutMillis(_))
    }

    /// Whether the caller can recover by changing its input (registry and
    /// driver-registry failures), as opposed to runtime faults.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            QueueError::AlreadyRegistered(_)
                | QueueError::UnknownType(_)
                | QueueError::MissingType
                | QueueError::DeserializationFailure { .. }
                | QueueError::DriverNotFound(_)
                | QueueError::DriverAlreadyRegistered(_)
                | QueueError::NoDefaultDriver
                | QueueError::Validation(_)
        )
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Persistence(err.to_string())
    }
}
