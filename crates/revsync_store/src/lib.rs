//! # RevSync Store
//!
//! The document-store surface the replication engine consumes.
//!
//! The actual storage engine (on-disk format, indexing, queries) is not part
//! of RevSync; the engine sees only the [`DocumentStore`] trait: revision
//! trees or version vectors per document, commit sequences, raw-document
//! stores for checkpoints, and change observation through the
//! [`SequenceTracker`].
//!
//! [`MemoryStore`] is a complete in-memory implementation used by the test
//! suite and as the reference for trait semantics.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod access;
mod error;
mod memory;
mod revid;
mod store;
mod tracker;
mod types;

pub use access::{
    suppress_warnings, warnings_suppressed, BackgroundDb, DbAccess, HandleId, WarningGuard,
};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryStore, MemoryStoreConfig};
pub use revid::{RevId, VectorOrder, VersionVector};
pub use store::{DocumentStore, RawDocument, LOCAL_CHECKPOINT_STORE, PEER_CHECKPOINT_STORE};
pub use tracker::{ChangeObserver, ObservedChanges, SequenceTracker};
pub use types::{
    AncestorLookup, Change, DocumentFlags, DocumentInfo, ForeignAncestor, InsertOutcome,
    PutRequest, RemoteId, RemoteSequence, RevFlags, RevisionInfo, Sequence,
};
