//! Shared error type for core operations.

/// The result type used by core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by core types and the lock table.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier segment failed validation.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the identifier invalid.
        message: String,
    },

    /// The lock key is already held by another operation.
    ///
    /// Callers treat this as "busy, retry later" and surface it as a
    /// temporary failure.
    #[error("the key is already locked: {key}")]
    AlreadyLocked {
        /// The key that was contended.
        key: String,
    },

    /// A lock key failed validation (empty or over the length bound).
    #[error("wrong key length, max length: {max}")]
    WrongKeyLength {
        /// The maximum accepted key length in bytes.
        max: usize,
    },
}

impl Error {
    /// Creates a new invalid identifier error.
    #[must_use]
    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::InvalidId {
            message: message.into(),
        }
    }
}
