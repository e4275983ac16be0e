//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Gang-scheduling policy name not present in the registry
    #[error("Unknown batch scheduler policy: {0}")]
    UnknownSchedulerPolicy(String),

    /// Gang-scheduling policy rejected by its plugin
    #[error("Invalid batch scheduler policy {policy}: {reason}")]
    InvalidSchedulerPolicy { policy: String, reason: String },

    /// Optimistic-concurrency check failed
    #[error("Version conflict: {0}")]
    Conflict(String),

    /// Object with the same name already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Write refused by the platform; repeating it unchanged will not help
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Repeated failure to converge
    #[error("Convergence error: {0}")]
    Convergence(String),

    /// Job submission rejected or unreadable
    #[error("Job submission error: {0}")]
    Submission(String),

    /// HTTP transport error talking to the Ray dashboard
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of an error for the reconcile scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid input. Not retried until the input changes.
    Configuration,
    /// Retried with backoff.
    Transient,
    /// Some mutations of a plan failed, the rest were applied.
    PartialPlan,
    /// Retry budget exhausted.
    Convergence,
    /// Object is gone.
    NotFound,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "Configuration"),
            ErrorKind::Transient => write!(f, "Transient"),
            ErrorKind::PartialPlan => write!(f, "PartialPlan"),
            ErrorKind::Convergence => write!(f, "Convergence"),
            ErrorKind::NotFound => write!(f, "NotFound"),
        }
    }
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
            || matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
            || matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409 && e.reason == "Conflict")
    }

    /// Check if this error reports an existing object on create
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
            || matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409 && e.reason == "AlreadyExists")
    }

    /// Check if this error is caused by invalid user input
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::UnknownSchedulerPolicy(_)
                | Error::InvalidSchedulerPolicy { .. }
        )
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, conflicts, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Conflict(_)
            | Error::AlreadyExists(_)
            | Error::Transient(_)
            | Error::Submission(_)
            | Error::Http(_) => true,
            Error::Validation(_)
            | Error::UnknownSchedulerPolicy(_)
            | Error::InvalidSchedulerPolicy { .. }
            | Error::MissingField(_)
            | Error::Convergence(_)
            | Error::Rejected(_)
            | Error::NotFound(_)
            | Error::Serialization(_) => false,
        }
    }

    /// Classify this error for the reconcile scheduler
    pub fn kind(&self) -> ErrorKind {
        if self.is_not_found() {
            ErrorKind::NotFound
        } else if self.is_configuration() {
            ErrorKind::Configuration
        } else if matches!(self, Error::Convergence(_)) {
            ErrorKind::Convergence
        } else if matches!(self, Error::MissingField(_) | Error::Serialization(_)) {
            ErrorKind::Configuration
        } else {
            ErrorKind::Transient
        }
    }

    /// Machine-readable reason used in status conditions and events
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "ApiError",
            Error::MissingField(_) => "MissingField",
            Error::Validation(_) => "InvalidSpec",
            Error::UnknownSchedulerPolicy(_) => "UnknownSchedulerPolicy",
            Error::InvalidSchedulerPolicy { .. } => "InvalidSchedulerPolicy",
            Error::Conflict(_) => "VersionConflict",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::NotFound(_) => "NotFound",
            Error::Transient(_) => "TransientError",
            Error::Rejected(_) => "Rejected",
            Error::Convergence(_) => "ConvergenceFailed",
            Error::Submission(_) => "SubmissionFailed",
            Error::Http(_) => "DashboardUnreachable",
            Error::Serialization(_) => "SerializationError",
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(3600)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
