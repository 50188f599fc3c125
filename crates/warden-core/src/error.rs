use thiserror::Error;

use crate::store::StoreError;

pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Failure kinds surfaced by the coordination components.
///
/// Admission outcomes (lock busy, rate limit hit, duplicate in flight) are *not* errors; they come back as
/// structured results. Store failures are always their own variant so that "store unreachable" can never be
/// read as "resource available".
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("{resource} is at capacity ({limit})")]
    CapacityExceeded { resource: String, limit: usize },

    #[error("execution of '{key}' failed: {reason}")]
    ExecutionFailure { key: String, reason: String },

    #[error("{resource} stayed contended after {attempts} attempts")]
    Contended { resource: String, attempts: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinationError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoordinationError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the failure came from the coordination store itself.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, CoordinationError::Store(_))
    }
}
