//! Core error types for laneway.

use std::fmt;

/// Core result type
pub type LaneResult<T> = Result<T, LaneError>;

/// Errors surfaced synchronously to callers that schedule work or build lanes.
///
/// Failures inside a running task never travel through this type; they are
/// captured as a [`TaskFailure`] and handed to the lane's observer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaneError {
    /// A schedule request was rejected before anything was queued
    #[error("Invalid schedule: {reason}")]
    InvalidSchedule {
        /// Why the request was rejected
        reason: String,
    },

    /// Configuration failed validation
    #[error("Invalid config for {field}: {reason}")]
    InvalidConfig {
        /// Offending field
        field: String,
        /// Why it is invalid
        reason: String,
    },

    /// No lane registered under this name
    #[error("Lane not found: {name}")]
    LaneNotFound {
        /// Requested lane name
        name: String,
    },

    /// Two lanes share a name
    #[error("Lane already exists: {name}")]
    DuplicateLane {
        /// Duplicated lane name
        name: String,
    },

    /// Alias chain loops back on itself
    #[error("Alias cycle through lane: {name}")]
    AliasCycle {
        /// A lane on the cycle
        name: String,
    },

    /// Worker thread could not be started
    #[error("Failed to spawn lane {name}: {reason}")]
    Spawn {
        /// Lane name
        name: String,
        /// OS error text
        reason: String,
    },
}

impl LaneError {
    /// Shorthand for [`LaneError::InvalidSchedule`]
    #[must_use]
    pub fn invalid_schedule(reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`LaneError::InvalidConfig`]
    #[must_use]
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A task body failed while running on a lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    message: String,
}

impl TaskFailure {
    /// Create a failure from a message
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Build a failure from a `catch_unwind` payload.
    ///
    /// `panic!` with a literal yields `&str`, with format args a `String`;
    /// anything else is opaque.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            Self::new(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Self::new(s.clone())
        } else {
            Self::new("task panicked with a non-string payload")
        }
    }

    /// Failure message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task failed: {}", self.message)
    }
}

impl std::error::Error for TaskFailure {}

impl From<serde_json::Error> for LaneError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_config("json", err.to_string())
    }
}
