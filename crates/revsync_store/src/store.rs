//! The document-store trait the replication engine consumes.

use crate::error::StoreResult;
use crate::revid::RevId;
use crate::tracker::SequenceTracker;
use crate::types::{
    AncestorLookup, Change, DocumentInfo, ForeignAncestor, InsertOutcome, PutRequest, RemoteId,
    RevisionInfo, Sequence,
};
use revsync_codec::SharedKeys;
use std::sync::Arc;

/// Name of the raw-document store holding local checkpoints.
pub const LOCAL_CHECKPOINT_STORE: &str = "checkpoints";

/// Name of the raw-document store holding checkpoints saved by peers.
pub const PEER_CHECKPOINT_STORE: &str = "peerCheckpoints";

/// A raw (non-versioned) document, used for checkpoint storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    /// Key within its store.
    pub key: String,
    /// Metadata string (the checkpoint rev token).
    pub meta: String,
    /// Body bytes.
    pub body: Vec<u8>,
}

/// Everything the replication engine needs from a document database.
///
/// Implementations must be internally synchronized; the engine additionally
/// serializes all write access through [`DbAccess`](crate::DbAccess), so
/// transactions never overlap.
pub trait DocumentStore: Send + Sync {
    /// The database's private UUID, used to derive checkpoint IDs.
    fn private_uuid(&self) -> [u8; 16];

    /// The shared-key table bodies in this store are encoded with.
    fn shared_keys(&self) -> Arc<SharedKeys>;

    /// True if this database identifies revisions by version vectors
    /// rather than rev-trees.
    fn using_version_vectors(&self) -> bool;

    /// Maximum revision-history depth retained per document.
    fn max_history_depth(&self) -> usize;

    /// The highest committed sequence number.
    fn last_sequence(&self) -> Sequence;

    /// Looks up (or registers) the remote ID for a peer URL.
    fn remote_id(&self, url: &str) -> StoreResult<RemoteId>;

    /// The tracker feeding change observers for this store.
    fn tracker(&self) -> Arc<SequenceTracker>;

    /// Enumerates committed changes with sequence greater than `since`,
    /// in sequence order, up to `limit` entries.
    fn changes_since(
        &self,
        since: Sequence,
        limit: usize,
        skip_deleted: bool,
    ) -> StoreResult<Vec<Change>>;

    /// Metadata of a document's current revision, or `None` if absent.
    fn get_document(&self, doc_id: &str) -> StoreResult<Option<DocumentInfo>>;

    /// Metadata and body of one specific revision, or `None` if absent.
    fn get_revision(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Option<RevisionInfo>>;

    /// Ancestors of `rev_id` (excluding it), newest first, at most
    /// `max_depth` entries. Stops after including the first ancestor found
    /// in `stop_at`.
    fn rev_history(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        max_depth: usize,
        stop_at: &[RevId],
    ) -> StoreResult<Vec<RevId>>;

    /// Classifies an incoming revision against local state: is it wanted,
    /// would it conflict, is it already marked at `remote`, and which of its
    /// ancestors exist locally.
    fn find_ancestors(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        remote: RemoteId,
        max_ancestors: usize,
    ) -> StoreResult<AncestorLookup>;

    /// For the current leaf of `doc_id`, walks parents for the nearest
    /// revision the peer is expected to have: one marked foreign, or one
    /// committed before `session_start`.
    fn foreign_ancestor_of(
        &self,
        doc_id: &str,
        session_start: Sequence,
    ) -> StoreResult<ForeignAncestor>;

    /// Documents that currently have unresolved conflicts.
    fn unresolved_conflicts(&self) -> StoreResult<Vec<DocumentInfo>>;

    /// Inserts a revision received from a peer. Must be called inside
    /// [`in_transaction`](DocumentStore::in_transaction).
    fn insert_existing_revision(&self, request: &PutRequest) -> StoreResult<InsertOutcome>;

    /// Runs `body` inside a single write transaction on `handle`. Writes
    /// are staged and become visible (and observable) only on commit; an
    /// error from `body` rolls everything back.
    fn in_transaction(
        &self,
        handle: u32,
        body: &mut dyn FnMut() -> StoreResult<()>,
    ) -> StoreResult<()>;

    /// Marks `rev_id` as known at `remote` (either because it was pushed
    /// there, or because the remote announced it).
    fn set_remote_ancestor(&self, doc_id: &str, rev_id: &RevId, remote: RemoteId)
        -> StoreResult<()>;

    /// Reads a raw document from a named store.
    fn raw_get(&self, store: &str, key: &str) -> StoreResult<Option<RawDocument>>;

    /// Writes a raw document into a named store.
    fn raw_put(&self, store: &str, key: &str, meta: &str, body: &[u8]) -> StoreResult<()>;

    /// Persists a cookie received from the remote, scoped to its hostname.
    fn set_cookie(&self, set_cookie: &str, hostname: &str) -> StoreResult<()>;
}
