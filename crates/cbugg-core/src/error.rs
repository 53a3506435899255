//! Error types for cbugg.

use thiserror::Error;

/// Result type alias using cbugg's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cbugg operations.
///
/// `NotFound`, `NotVisible`, `Forbidden`, `UnhandledField` and `InvalidInput`
/// are terminal: they are surfaced to the caller as-is and never retried.
#[derive(Error, Debug)]
pub enum Error {
    /// Record or target document absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// The acting user may not see this record
    #[error("Not visible: {0}")]
    NotVisible(String),

    /// The record is visible but the requested action is refused
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Mutation of a field the engine does not handle
    #[error("Unhandled field: {0}")]
    UnhandledField(String),

    /// Malformed value for an otherwise valid request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A freshly generated id already existed. Never retryable.
    #[error("Id collision: {0}")]
    IdCollision(String),

    /// The store exhausted its CAS retry budget
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Document store backend failure
    #[error("Store error: {0}")]
    Store(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error describes the request rather than the system.
    ///
    /// Client errors map to 4xx responses at the HTTP edge.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::NotVisible(_)
                | Error::Forbidden(_)
                | Error::UnhandledField(_)
                | Error::InvalidInput(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
