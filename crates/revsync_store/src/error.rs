//! Error types for store operations.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in document-store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Document or revision not found.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// The operation would create (or met) a conflicting revision.
    #[error("conflict on document '{doc_id}'")]
    Conflict {
        /// The conflicted document.
        doc_id: String,
    },

    /// The document or revision is deleted.
    #[error("document '{doc_id}' is deleted")]
    Deleted {
        /// The deleted document.
        doc_id: String,
    },

    /// Stored data could not be parsed.
    #[error("corrupt data: {message}")]
    CorruptData {
        /// Description of the corruption.
        message: String,
    },

    /// A caller-supplied argument was invalid.
    #[error("invalid parameter: {message}")]
    InvalidParameter {
        /// Description of the problem.
        message: String,
    },

    /// An operation requiring a transaction ran outside one, or vice versa.
    #[error("transaction misuse: {message}")]
    TransactionMisuse {
        /// Description of the misuse.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("unexpected error: {message}")]
    UnexpectedError {
        /// Description of the failure.
        message: String,
    },

    /// An error reported by the remote peer.
    #[error("remote error: {message}")]
    RemoteError {
        /// Description of the remote failure.
        message: String,
    },
}

impl StoreError {
    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a conflict error.
    pub fn conflict(doc_id: impl Into<String>) -> Self {
        Self::Conflict {
            doc_id: doc_id.into(),
        }
    }

    /// Creates a corrupt-data error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptData {
            message: message.into(),
        }
    }

    /// Creates an invalid-parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates a transaction-misuse error.
    pub fn transaction_misuse(message: impl Into<String>) -> Self {
        Self::TransactionMisuse {
            message: message.into(),
        }
    }

    /// Creates an unexpected-error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedError {
            message: message.into(),
        }
    }

    /// Returns true if this error means "no such thing" rather than failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
