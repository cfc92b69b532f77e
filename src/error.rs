use thiserror::Error;

use crate::storage::StoreError;

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Error kinds callers can branch on without matching messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DuplicateResource,
    NotFound,
    InvalidStatistic,
    InvalidIdentifier,
    StoreUnavailable,
    UnexpectedState,
}

/// Errors surfaced by queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// An item with the same url (or the same full payload when forced) already exists
    #[error("{0}")]
    DuplicateResource(String),

    /// No item with the requested id, or a positional lookup past the end
    #[error("{0}")]
    NotFound(String),

    /// Statistic name outside the allowed set
    #[error("Invalid statistic: {0}")]
    InvalidStatistic(String),

    /// A value under an id key is not a well-formed identifier
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The underlying store failed or is not reachable
    #[error("Store error: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The store reported a failed write without a more specific cause
    #[error("Unexpected state: {0}")]
    UnexpectedState(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateResource(_) => ErrorKind::DuplicateResource,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidStatistic(_) => ErrorKind::InvalidStatistic,
            Self::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::UnexpectedState(_) => ErrorKind::UnexpectedState,
        }
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::DuplicateResource(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedState(message.into())
    }

    /// Queue used before `init()` or after `finalize()`
    pub fn not_initialized() -> Self {
        Self::StoreUnavailable(StoreError::NotConnected)
    }
}
