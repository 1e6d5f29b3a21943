//! Crate-wide error type.
//!
//! Every public operation in the workspace returns `Result<T, MantisError>`.
//! Internal plumbing is free to use `anyhow::Result` and `?`; the conversion
//! from `MantisError` is automatic because it implements `std::error::Error`.

use thiserror::Error;

/// Unified error kind for all MantisDB components.
///
/// Variants map directly onto the error table: each one carries the
/// information needed both for a caller decision (retry? user error?) and
/// for the thin HTTP boundary to choose a status code via [`MantisError::status_code`].
#[derive(Debug, Error)]
pub enum MantisError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("invalid key: {0}")]
    KeyInvalid(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("value too large: {size} bytes exceeds limit of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("storage error ({kind}): {cause}")]
    StorageError {
        kind: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl MantisError {
    /// Status code this error would surface as at the HTTP boundary (§6/§7).
    /// Core crates never depend on an HTTP crate for this — it's a plain
    /// integer any boundary can translate into its own response type.
    pub fn status_code(&self) -> u16 {
        match self {
            MantisError::NotFound => 404,
            MantisError::AlreadyExists => 409,
            MantisError::KeyInvalid(_) | MantisError::SchemaViolation(_) => 400,
            MantisError::ValueTooLarge { .. } => 400,
            MantisError::UniqueViolation(_) => 409,
            MantisError::Cancelled => 499,
            MantisError::Timeout => 408,
            MantisError::ResourceExhausted(_) => 503,
            MantisError::StorageError { .. } => 500,
            MantisError::Internal(_) => 500,
        }
    }

    /// Whether a caller may retry this error with backoff. User errors are
    /// never retried by the core (§7); this mirrors that classification for
    /// external callers deciding whether to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MantisError::StorageError { .. } | MantisError::Timeout | MantisError::ResourceExhausted(_)
        )
    }
}

pub type MantisResult<T> = std::result::Result<T, MantisError>;
