//! Core data types shared by the store and the replication engine.

use crate::revid::RevId;
use std::fmt;

/// A per-database commit sequence number. 0 means "none".
pub type Sequence = u64;

/// An opaque change-feed cursor supplied by the remote peer.
///
/// Often numeric but not necessarily; only equality and presence are
/// meaningful on this side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RemoteSequence(String);

impl RemoteSequence {
    /// Creates a remote sequence from its wire form.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The wire form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if no sequence was supplied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RemoteSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for RemoteSequence {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Identifies a remote peer within a store, for per-remote ancestor marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteId(pub u32);

/// Flags on a single revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevFlags {
    /// The revision is a deletion (tombstone).
    pub deleted: bool,
    /// The revision body references attachments.
    pub has_attachments: bool,
    /// The revision was received from a peer, not authored locally.
    pub foreign: bool,
    /// The revision is a non-winning conflicting leaf.
    pub conflict: bool,
}

impl RevFlags {
    /// Flags for a plain local revision.
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns a copy with `deleted` set.
    pub fn deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Returns a copy with `foreign` set.
    pub fn foreign(mut self, foreign: bool) -> Self {
        self.foreign = foreign;
        self
    }
}

/// Flags on a document as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentFlags {
    /// The current revision is a deletion.
    pub deleted: bool,
    /// The document has more than one live leaf revision.
    pub conflicted: bool,
}

/// Metadata (and body) of a document's current revision.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    /// Document ID.
    pub doc_id: String,
    /// Current revision ID.
    pub rev_id: RevId,
    /// Document flags.
    pub flags: DocumentFlags,
    /// Commit sequence of the current revision.
    pub sequence: Sequence,
    /// Size of the encoded body in bytes.
    pub body_size: u64,
}

/// Metadata and body of one specific revision.
#[derive(Debug, Clone)]
pub struct RevisionInfo {
    /// Revision ID.
    pub rev_id: RevId,
    /// Revision flags.
    pub flags: RevFlags,
    /// Commit sequence.
    pub sequence: Sequence,
    /// Encoded body, if retained.
    pub body: Option<Vec<u8>>,
}

/// One committed change, as reported by change enumeration and observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Commit sequence of the change.
    pub sequence: Sequence,
    /// Document ID.
    pub doc_id: String,
    /// The document's current revision ID after the change.
    pub rev_id: RevId,
    /// Whether the change is a deletion.
    pub deleted: bool,
    /// Size of the encoded body in bytes.
    pub body_size: u64,
}

/// Result of classifying an incoming revision against local state.
#[derive(Debug, Clone, Default)]
pub struct AncestorLookup {
    /// Local state is older: the incoming revision is wanted.
    pub local_is_older: bool,
    /// The incoming revision would conflict with the local current revision.
    pub conflict: bool,
    /// The revision exists locally and is already marked as known at the
    /// querying remote.
    pub at_this_remote: bool,
    /// Ancestor revisions of the incoming revision that exist locally,
    /// newest first.
    pub ancestors: Vec<RevId>,
}

/// Result of the foreign-ancestor walk used by `proposeChanges` pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForeignAncestor {
    /// The current leaf itself is foreign; the peer originated it, so the
    /// document should not be proposed at all.
    SkipForeignLeaf,
    /// The nearest revision the peer is expected to already have, if any.
    Ancestor(Option<RevId>),
}

/// A request to insert an already-identified revision (one received from a
/// peer) into the store.
#[derive(Debug, Clone)]
pub struct PutRequest {
    /// Document ID.
    pub doc_id: String,
    /// Encoded body (using this store's shared keys).
    pub body: Vec<u8>,
    /// Revision history, newest first; the first entry is the revision
    /// being inserted.
    pub history: Vec<RevId>,
    /// Flags for the new revision.
    pub rev_flags: RevFlags,
    /// Allow the insert even if it creates a conflicting branch.
    pub allow_conflict: bool,
    /// The remote the revision came from, recorded as an ancestor mark.
    pub remote: Option<RemoteId>,
}

/// Outcome of inserting an existing revision.
#[derive(Debug, Clone, Copy)]
pub struct InsertOutcome {
    /// Sequence assigned to the new revision.
    pub sequence: Sequence,
    /// True if the document now has multiple live leaves.
    pub conflicted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_sequence_is_opaque() {
        let numeric = RemoteSequence::from(42);
        let stringy = RemoteSequence::new("42");
        assert_eq!(numeric, stringy);
        assert!(RemoteSequence::default().is_empty());
        assert!(!numeric.is_empty());
    }

    #[test]
    fn rev_flags_builders() {
        let flags = RevFlags::none().deleted(true).foreign(true);
        assert!(flags.deleted);
        assert!(flags.foreign);
        assert!(!flags.conflict);
    }
}
