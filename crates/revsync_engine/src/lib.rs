//! # RevSync Engine
//!
//! A bidirectional document-replication engine.
//!
//! Two peers, each holding a local database of revision-tracked documents,
//! synchronize over a single duplex message transport with resumable
//! checkpoints, conflict detection, and incremental propagation of new
//! revisions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          Replicator                            │
//! │   session lifecycle · status aggregation · checkpoints         │
//! │                                                                │
//! │   ┌────────┐   ┌───────────┐   ┌────────┐   ┌──────────┐       │
//! │   │ Pusher │   │ RevFinder │──►│ Puller │──►│ Inserter │       │
//! │   └───┬────┘   └─────▲─────┘   └───▲────┘   └────┬─────┘       │
//! │       │              │             │             ▼             │
//! │       │        changes/rev msgs    │       batched txn         │
//! └───────┼──────────────┼─────────────┼─────────────┼─────────────┘
//!         ▼              │             │             ▼
//!     Connection ◄───────┴─────────────┘       DocumentStore
//! ```
//!
//! Each component is a mailbox actor: handlers run one at a time on a
//! dedicated executor, and all cross-component traffic is enqueued.
//!
//! The document store and the framed transport are external collaborators,
//! seen only through the [`revsync_store::DocumentStore`] and
//! [`Connection`] traits. [`pipe::InProcessPipe`] provides an in-process
//! transport for tests and local replication.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod actor;
mod checkpointer;
mod connection;
mod delegate;
mod error;
mod inserter;
mod options;
pub mod pipe;
mod puller;
mod pusher;
mod replicator;
mod revfinder;
mod status;
mod tuning;

pub use checkpointer::Checkpointer;
pub use connection::{
    CloseCode, CloseReason, CloseStatus, Connection, ConnectionDelegate, ConnectionState,
    IncomingRequest, ReplyError, ReplyResult, ResponseCallback,
};
pub use delegate::{BlobProgress, Direction, DocumentEnded, NoopDelegate, ReplicatorDelegate};
pub use error::{stopping_severity, ErrorDomain, StoppingSeverity, SyncError, SyncResult};
pub use options::{ReplMode, ReplicatorOptions};
pub use replicator::Replicator;
pub use status::{ActivityLevel, Progress, Status};
pub use tuning::{
    CHANGES_BATCH_SIZE, DEFAULT_CHECKPOINT_SAVE_DELAY, INSERTION_DELAY,
    MIN_BODY_SIZE_TO_COMPRESS, MIN_DELEGATE_CALL_INTERVAL,
};
