//! Error taxonomy for the coach pipeline.
//!
//! Collaborator failures (storage, embedding, generation) are caught at the
//! call site and degraded to the next rule; only `BadRequest` reaches the
//! caller as a client error.

/// Result type for coach operations.
pub type CoachResult<T> = Result<T, CoachError>;

#[derive(Debug, thiserror::Error)]
pub enum CoachError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("backend call failed: {0}")]
    Backend(String),

    #[error("malformed backend output: {0}")]
    Parse(String),

    #[error("{0}")]
    BadRequest(String),
}
