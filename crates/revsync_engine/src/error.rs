//! Error taxonomy for the replication engine.

use revsync_protocol::ErrorResponse;
use revsync_store::StoreError;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// The domain a [`SyncError`] code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    /// Storage and engine-logic errors.
    Storage,
    /// Errors mapped from OS errnos.
    Posix,
    /// DNS, TLS, and connection-level errors.
    Network,
    /// WebSocket close codes.
    WebSocket,
    /// HTTP-style status codes reported by the peer.
    Http,
}

/// Storage-domain error codes.
pub mod storage_codes {
    /// Document or revision not found.
    pub const NOT_FOUND: i32 = 1;
    /// Conflicting revisions.
    pub const CONFLICT: i32 = 2;
    /// Document is deleted.
    pub const DELETED: i32 = 3;
    /// Stored data could not be parsed.
    pub const CORRUPT_DATA: i32 = 4;
    /// Invalid parameter.
    pub const INVALID_PARAMETER: i32 = 5;
    /// Internal invariant violation.
    pub const UNEXPECTED: i32 = 6;
    /// Error reported by the remote peer.
    pub const REMOTE: i32 = 7;
    /// Transaction misuse.
    pub const TRANSACTION: i32 = 8;
}

/// WebSocket close codes.
pub mod ws_codes {
    /// Clean close.
    pub const NORMAL: i32 = 1000;
    /// The peer is going away.
    pub const GOING_AWAY: i32 = 1001;
    /// Protocol violation.
    pub const PROTOCOL_ERROR: i32 = 1002;
    /// Application-level permanent failure.
    pub const APP_PERMANENT: i32 = 4001;
    /// Application-level transient failure.
    pub const APP_TRANSIENT: i32 = 4002;
}

/// A replication error: a domain, a domain-specific code, and a message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{domain:?} error {code}: {message}")]
pub struct SyncError {
    /// Error domain.
    pub domain: ErrorDomain,
    /// Domain-specific code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl SyncError {
    /// Creates an error in an arbitrary domain.
    pub fn new(domain: ErrorDomain, code: i32, message: impl Into<String>) -> Self {
        Self {
            domain,
            code,
            message: message.into(),
        }
    }

    /// A storage-domain conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Storage, storage_codes::CONFLICT, message)
    }

    /// A storage-domain unexpected-failure error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Storage, storage_codes::UNEXPECTED, message)
    }

    /// An HTTP-status error reported by the peer.
    pub fn http(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Http, code, message)
    }

    /// A WebSocket close-code error.
    pub fn web_socket(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::WebSocket, code, message)
    }

    /// A network-level error.
    pub fn network(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorDomain::Network, code, message)
    }

    /// True for conflicts, in any domain's encoding.
    pub fn is_conflict(&self) -> bool {
        matches!(
            (self.domain, self.code),
            (ErrorDomain::Storage, storage_codes::CONFLICT) | (ErrorDomain::Http, 409)
        )
    }

    /// True if this error means "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            (self.domain, self.code),
            (ErrorDomain::Storage, storage_codes::NOT_FOUND) | (ErrorDomain::Http, 404)
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::NotFound { .. } => storage_codes::NOT_FOUND,
            StoreError::Conflict { .. } => storage_codes::CONFLICT,
            StoreError::Deleted { .. } => storage_codes::DELETED,
            StoreError::CorruptData { .. } => storage_codes::CORRUPT_DATA,
            StoreError::InvalidParameter { .. } => storage_codes::INVALID_PARAMETER,
            StoreError::TransactionMisuse { .. } => storage_codes::TRANSACTION,
            StoreError::UnexpectedError { .. } => storage_codes::UNEXPECTED,
            StoreError::RemoteError { .. } => storage_codes::REMOTE,
        };
        Self::new(ErrorDomain::Storage, code, e.to_string())
    }
}

impl From<ErrorResponse> for SyncError {
    fn from(e: ErrorResponse) -> Self {
        Self::http(i32::from(e.code), e.message)
    }
}

/// How a recognized fatal error should close the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppingSeverity {
    /// Disconnect with a permanent application close code.
    Permanent,
    /// Disconnect with a transient application close code.
    Transient,
}

struct StoppingErrorEntry {
    domain: ErrorDomain,
    code: i32,
    severity: StoppingSeverity,
    message: &'static str,
}

// Errors the session deliberately disconnects on.
const STOPPING_ERRORS: &[StoppingErrorEntry] = &[
    StoppingErrorEntry {
        domain: ErrorDomain::Storage,
        code: storage_codes::UNEXPECTED,
        severity: StoppingSeverity::Permanent,
        message: "An internal error occurred",
    },
    StoppingErrorEntry {
        domain: ErrorDomain::Http,
        code: 403,
        severity: StoppingSeverity::Permanent,
        message: "An attempt was made to perform an unauthorized action",
    },
    StoppingErrorEntry {
        domain: ErrorDomain::Http,
        code: 503,
        severity: StoppingSeverity::Transient,
        message: "The server is over capacity",
    },
];

/// Looks up whether `error` is one the session must disconnect on,
/// returning the severity and the canned close message.
pub fn stopping_severity(error: &SyncError) -> Option<(StoppingSeverity, &'static str)> {
    STOPPING_ERRORS
        .iter()
        .find(|entry| entry.domain == error.domain && entry.code == error.code)
        .map(|entry| (entry.severity, entry.message))
}
