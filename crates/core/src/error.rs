//! Error types for the assured job recovery library.

use thiserror::Error;

/// The main error type for the assured library.
#[derive(Error, Debug)]
pub enum AssuredError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store error (connectivity, command failure).
    #[error("Backend error: {0}")]
    Backend(String),

    /// The job runtime refused or failed to accept a resubmitted job.
    #[error("Enqueue error: {0}")]
    Enqueue(String),

    /// No tracked payload exists for the job.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job is tracked by an instance that is still alive.
    #[error("Job is not orphaned: {0}")]
    NotOrphaned(String),
}

/// Result type alias using AssuredError.
pub type Result<T> = std::result::Result<T, AssuredError>;
