//! Error types for infrakit
//!
//! Errors are structured with fields to aid debugging in production.
//! Store errors carry the resource kind and id, step errors carry the
//! step name, so a single log line identifies what failed.

use std::time::Duration;

use thiserror::Error;

use crate::query::QueryError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for infrakit operations
#[derive(Debug, Error)]
pub enum Error {
    /// Resource does not exist in the store
    #[error("{kind} {id:?} not found")]
    NotFound {
        /// Resource type
        kind: String,
        /// Resource id
        id: String,
    },

    /// Resource already exists in the store
    #[error("{kind} {id:?} already exists")]
    AlreadyExists {
        /// Resource type
        kind: String,
        /// Resource id
        id: String,
    },

    /// Write rejected: version mismatch or pending finalizers
    #[error("conflict on {kind} {id:?}: {message}")]
    Conflict {
        /// Resource type
        kind: String,
        /// Resource id
        id: String,
        /// Description of the conflict
        message: String,
    },

    /// Malformed label selector
    #[error("invalid label query: {0}")]
    Query(#[from] QueryError),

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Retryable condition: revisit the request after `after`
    #[error("requeue in {after:?}: {message}")]
    Requeue {
        /// Interval after which the request should be reconciled again
        after: Duration,
        /// What the step is waiting for
        message: String,
    },

    /// Fatal failure of a provisioning step
    #[error("step {step:?} failed: {message}")]
    StepFailed {
        /// Name of the failed step
        step: String,
        /// Error reported by the step
        message: String,
    },

    /// A watched resource could not be mapped to a machine request
    #[error("cannot map {kind} {id:?}: {message}")]
    Mapping {
        /// Resource type of the changed input
        kind: String,
        /// Resource id of the changed input
        id: String,
        /// Why no mapping exists
        message: String,
    },

    /// Failure reported by a provider hook (deprovision, health check)
    #[error("provider error [{provider}]: {message}")]
    Provider {
        /// Provider id
        provider: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The surrounding watch context ended
    #[error("reconciliation cancelled")]
    Cancelled,

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "runtime", "teardown")
        context: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        kind: impl Into<String>,
        id: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create the retry signal: the request is revisited after `after`
    pub fn requeue(after: Duration, msg: impl Into<String>) -> Self {
        Self::Requeue {
            after,
            message: msg.into(),
        }
    }

    /// Create a fatal step failure
    pub fn step_failed(step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Create a mapping error for a watched input
    pub fn mapping(
        kind: impl Into<String>,
        id: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Mapping {
            kind: kind.into(),
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a provider hook error
    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True if the resource was already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True if the write lost an optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Interval carried by the requeue signal, if this is one
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::Requeue { after, .. } => Some(*after),
            _ => None,
        }
    }

    /// Message suitable for the status error field
    ///
    /// Strips the variant prefix for step and requeue errors so the user sees
    /// what the provider reported.
    pub fn status_message(&self) -> String {
        match self {
            Error::Requeue { message, .. } => message.clone(),
            Error::StepFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
