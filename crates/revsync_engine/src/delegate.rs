//! The delegate surface a replication session reports to.

use crate::connection::CloseStatus;
use crate::error::SyncError;
use crate::status::Status;

/// Which direction a document outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The document was being pushed to the peer.
    Push,
    /// The document was being pulled from the peer.
    Pull,
}

/// The final outcome of replicating one document revision.
#[derive(Debug, Clone)]
pub struct DocumentEnded {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID, in wire form.
    pub rev_id: String,
    /// Transfer direction.
    pub direction: Direction,
    /// The error that ended the document, if any. A conflict error with
    /// `error_is_transient` means the revision was stored but the document
    /// now needs conflict resolution.
    pub error: Option<SyncError>,
    /// True if the error does not prevent a later retry.
    pub error_is_transient: bool,
}

/// Progress of one blob (attachment) transfer.
#[derive(Debug, Clone)]
pub struct BlobProgress {
    /// Owning document ID.
    pub doc_id: String,
    /// Content digest of the blob.
    pub digest: String,
    /// Bytes transferred.
    pub completed: u64,
    /// Total bytes.
    pub total: u64,
}

/// Callbacks from a replication session.
///
/// All methods have empty defaults so implementations override only what
/// they observe. After a `Stopped` status has been delivered, no further
/// calls are made.
pub trait ReplicatorDelegate: Send + Sync {
    /// The aggregated status changed. Throttled: at most one call per
    /// minimum interval unless the activity level changed.
    fn status_changed(&self, _status: &Status) {}

    /// A batch of documents finished replicating (successfully or not).
    fn documents_ended(&self, _documents: &[DocumentEnded]) {}

    /// A blob transfer made progress.
    fn blob_progress(&self, _progress: &BlobProgress) {}

    /// The HTTP upgrade response arrived.
    fn got_http_response(&self, _status: u16, _headers: &[(String, String)]) {}

    /// The connection closed.
    fn connection_closed(&self, _status: &CloseStatus) {}

    /// The peer presented a TLS certificate.
    fn got_tls_certificate(&self, _cert: &[u8]) {}
}

/// A delegate that ignores everything.
pub struct NoopDelegate;

impl ReplicatorDelegate for NoopDelegate {}
