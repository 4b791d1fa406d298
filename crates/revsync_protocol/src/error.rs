//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol bodies.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A message body was not the expected JSON shape.
    #[error("invalid body: {message}")]
    InvalidBody {
        /// Description of the problem.
        message: String,
    },

    /// One entry of a changes list was malformed.
    #[error("invalid entry {index}: {message}")]
    InvalidEntry {
        /// Zero-based entry index.
        index: usize,
        /// Description of the problem.
        message: String,
    },

    /// A checkpoint revision token was malformed.
    #[error("invalid checkpoint rev '{token}'")]
    InvalidCheckpointRev {
        /// The offending token.
        token: String,
    },
}

impl ProtocolError {
    /// Creates an invalid-body error.
    pub fn invalid_body(message: impl Into<String>) -> Self {
        Self::InvalidBody {
            message: message.into(),
        }
    }

    /// Creates an invalid-entry error.
    pub fn invalid_entry(index: usize, message: impl Into<String>) -> Self {
        Self::InvalidEntry {
            index,
            message: message.into(),
        }
    }
}
