//! Error types for the codec.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding document bodies.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input ended before a complete value was read.
    #[error("truncated input at offset {offset}")]
    Truncated {
        /// Byte offset where more data was expected.
        offset: usize,
    },

    /// An unknown type tag was encountered.
    #[error("invalid tag 0x{tag:02x} at offset {offset}")]
    InvalidTag {
        /// The offending tag byte.
        tag: u8,
        /// Byte offset of the tag.
        offset: usize,
    },

    /// A shared-key reference did not resolve in the table.
    #[error("unknown shared key {id}")]
    UnknownSharedKey {
        /// The unresolved key ID.
        id: u16,
    },

    /// A text string was not valid UTF-8.
    #[error("invalid UTF-8 in text string")]
    InvalidUtf8,

    /// Trailing bytes remained after the root value.
    #[error("{extra} trailing bytes after value")]
    TrailingBytes {
        /// Number of unread bytes.
        extra: usize,
    },

    /// The value cannot be represented in this format.
    #[error("unsupported value: {message}")]
    Unsupported {
        /// Description of the unsupported construct.
        message: String,
    },

    /// Structurally invalid data (e.g. a non-string map key).
    #[error("invalid structure: {message}")]
    InvalidStructure {
        /// Description of the structural problem.
        message: String,
    },
}

impl CodecError {
    /// Creates an unsupported-value error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Creates an invalid-structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }
}
