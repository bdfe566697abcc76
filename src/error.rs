//! Error types for the concurrency primitives.

use thiserror::Error;

/// Result type for concurrency operations
pub type ConcurrencyResult<T> = Result<T, ConcurrencyError>;

/// Errors surfaced by the concurrency primitives.
///
/// `Timeout` and `Interrupted` are flow conditions, not faults: callers can
/// retry a timed-out operation but should abandon an interrupted one (the
/// component was disabled or is shutting down). The remaining variants are
/// precondition faults reported as no-op failures with no side effects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// The timed wait expired before the operation could complete
    #[error("operation timed out")]
    Timeout,

    /// The component was disabled while the caller was waiting
    #[error("interrupted: component disabled")]
    Interrupted,

    /// Invalid argument or bounds violation; the call had no effect
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The targeted task is not in a state that permits the operation
    #[error("task is not in a state that permits this operation")]
    InvalidState,

    /// The component is no longer accepting work
    #[error("shutting down")]
    ShuttingDown,

    /// No live task or value with the given identity
    #[error("not found")]
    NotFound,

    /// The cell already holds a value
    #[error("value already assigned")]
    AlreadyAssigned,

    /// The OS refused to create a worker thread
    #[error("thread spawn failed: {0}")]
    Spawn(String),
}

impl ConcurrencyError {
    /// True for the retryable flow condition.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConcurrencyError::Timeout)
    }

    /// True when the component was disabled out from under the caller.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ConcurrencyError::Interrupted)
    }
}
