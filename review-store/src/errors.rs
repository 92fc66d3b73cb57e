//! Store-level error hierarchy.
//!
//! One root `StoreError` for everything the store exposes. Lease loss is a
//! dedicated variant because workers must treat it differently from plain
//! database failures (abort the iteration, post nothing).

use thiserror::Error;

/// Convenient alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Root error type for the review-store crate.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// JSON (de)serialization of a payload or detail blob failed.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The caller's lease on a job is no longer valid (expired and
    /// reclaimed, or the job vanished).
    #[error("lease lost for job {job_id}")]
    LeaseLost { job_id: String },

    /// A row that must exist was not found (bad connector id, unknown job).
    #[error("not found: {0}")]
    NotFound(String),
}
