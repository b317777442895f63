//! Error types for batchscout.
//!
//! Library crates use [`BatchScoutError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! [`PhaseError`] is deliberately separate: it is raised by a collaborator
//! during one phase of one job and is recorded on that job, never
//! propagated to the batch.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::{DetailValue, Details, JobId, PhaseName};

/// Top-level error type for all batchscout operations.
#[derive(Debug, thiserror::Error)]
pub enum BatchScoutError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error raised by a collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The resource pool could not produce a processing unit.
    #[error("resource creation error: {0}")]
    ResourceCreation(String),

    /// The batch could not schedule a job.
    #[error("admission error: {0}")]
    Admission(String),

    /// A phase transition that violates the pipeline order.
    #[error("invalid transition for job {job_id}: {message}")]
    InvalidTransition { job_id: JobId, message: String },

    /// No job with this id is tracked.
    #[error("job not found: {0}")]
    NotFound(JobId),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BatchScoutError>;

impl BatchScoutError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn resource_creation(msg: impl Into<String>) -> Self {
        Self::ResourceCreation(msg.into())
    }

    pub fn admission(msg: impl Into<String>) -> Self {
        Self::Admission(msg.into())
    }

    pub fn invalid_transition(job_id: &JobId, msg: impl Into<String>) -> Self {
        Self::InvalidTransition {
            job_id: job_id.clone(),
            message: msg.into(),
        }
    }

    /// Whether this error comes from the pool or admission layer and must
    /// abort the whole batch rather than a single job.
    pub fn is_batch_level(&self) -> bool {
        matches!(self, Self::ResourceCreation(_) | Self::Admission(_))
    }
}

// ---------------------------------------------------------------------------
// PhaseError
// ---------------------------------------------------------------------------

/// Failure reported by a collaborator while executing one phase.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct PhaseError {
    /// Human-readable failure description.
    pub message: String,
    /// Observability payload captured at the point of failure.
    pub details: Details,
}

impl PhaseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            details: Details::new(),
        }
    }

    /// Attach one detail entry to the error.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<DetailValue>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Replace the error's details wholesale.
    pub fn with_details(mut self, details: Details) -> Self {
        self.details = details;
        self
    }

    /// A phase that did not finish within its bounded wait.
    pub fn timeout(phase: PhaseName, after: Duration) -> Self {
        Self::new(format!("{phase} timed out after {}s", after.as_secs_f64()))
            .with_detail("timeout_ms", after.as_millis() as i64)
    }
}

impl From<BatchScoutError> for PhaseError {
    fn from(err: BatchScoutError) -> Self {
        Self::new(err.to_string())
    }
}
