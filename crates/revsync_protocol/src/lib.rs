//! # RevSync Protocol
//!
//! Wire-protocol types for RevSync replication.
//!
//! This crate defines the shapes exchanged between peers over the framed
//! message transport:
//! - profile-tagged request/response [`Message`]s with string properties,
//! - `changes` / `proposeChanges` bodies and their positional responses,
//! - checkpoint bodies and the peer-checkpoint revision token.
//!
//! This is a pure protocol crate with no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changes;
mod checkpoint;
mod error;
mod message;

pub use changes::{
    ChangesEntry, ChangesResponse, ChangesResponseWriter, ProposedEntry, ResponseAnswer,
};
pub use checkpoint::{CheckpointBody, PeerCheckpointRev};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{profiles, ErrorResponse, Message};
