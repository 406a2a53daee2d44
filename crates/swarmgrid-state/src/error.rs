//! Error types for the SwarmGrid worker registry.

use thiserror::Error;

/// Result type alias for registry operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors surfaced by the registry.
///
/// Storage failures are reported as-is and never retried here; the caller
/// owns the retry policy.
#[derive(Debug, Error)]
pub enum StateError {
    /// The backing store could not be opened, read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// The operation referenced a hostname or node the registry has never seen.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}
