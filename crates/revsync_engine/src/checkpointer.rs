//! Checkpoint derivation, persistence, and reconciliation.

use crate::options::ReplicatorOptions;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use revsync_protocol::{CheckpointBody, PeerCheckpointRev};
use revsync_store::{
    DbAccess, DocumentStore, RawDocument, StoreError, StoreResult, LOCAL_CHECKPOINT_STORE,
    PEER_CHECKPOINT_STORE,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Tracks one session's sync progress and its persisted forms.
///
/// The checkpoint pairs the minimum unreplicated local sequence with the
/// minimum unreplicated remote sequence. It is persisted locally in the
/// `checkpoints` raw store and remotely on the peer under the same
/// client-chosen ID.
pub struct Checkpointer {
    checkpoint_id: String,
    body: CheckpointBody,
    unsaved: bool,
    saving: bool,
}

impl Checkpointer {
    /// Creates a checkpointer for a session, deriving the stable checkpoint
    /// ID from the database UUID, the remote URL, and the replication
    /// filters.
    pub fn new(options: &ReplicatorOptions, db_uuid: [u8; 16]) -> Self {
        Self {
            checkpoint_id: derive_checkpoint_id(options, db_uuid),
            body: CheckpointBody::default(),
            unsaved: false,
            saving: false,
        }
    }

    /// The ID used to look the checkpoint up before the first successful
    /// save.
    pub fn initial_checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }

    /// The ID the checkpoint is saved under. Stable for a given
    /// (database, peer, options) tuple.
    pub fn checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }

    /// Minimum unreplicated local sequence.
    pub fn local_min_sequence(&self) -> u64 {
        self.body.local
    }

    /// Minimum unreplicated remote sequence, in wire form.
    pub fn remote_min_sequence(&self) -> &str {
        &self.body.remote
    }

    /// Reads the local checkpoint. With `reset`, any stored state is
    /// ignored and the checkpoint starts from zero. Returns true if a
    /// stored checkpoint was found (and not reset).
    pub fn read_local(&mut self, db: &DbAccess, reset: bool) -> StoreResult<bool> {
        if reset {
            info!("ignoring local checkpoint ('reset' option is set)");
            self.body = CheckpointBody::default();
            return Ok(false);
        }
        let doc = db.use_store(|store| store.raw_get(LOCAL_CHECKPOINT_STORE, &self.checkpoint_id))?;
        match doc {
            Some(doc) => {
                self.body = CheckpointBody::from_json(&doc.body)
                    .map_err(|e| StoreError::corrupt(e.to_string()))?;
                info!(
                    checkpoint = %self.checkpoint_id,
                    local = self.body.local,
                    remote = %self.body.remote,
                    "read local checkpoint"
                );
                Ok(true)
            }
            None => {
                info!(checkpoint = %self.checkpoint_id, "no local checkpoint");
                Ok(false)
            }
        }
    }

    /// Persists the given checkpoint JSON locally, with the peer's rev
    /// token as metadata.
    pub fn write_local(&self, db: &DbAccess, json: &[u8], remote_rev: &str) -> StoreResult<()> {
        db.use_store(|store| {
            store.raw_put(LOCAL_CHECKPOINT_STORE, &self.checkpoint_id, remote_rev, json)
        })
    }

    /// Compares the local checkpoint against the one fetched from the
    /// peer. Returns false when the peer's record is missing or disagrees,
    /// which means push progress must be re-enumerated from the beginning.
    pub fn validate_with(&self, remote: Option<&CheckpointBody>) -> bool {
        if self.body.is_empty() {
            return true;
        }
        match remote {
            Some(remote_body) => remote_body == &self.body,
            None => false,
        }
    }

    /// Discards all recorded progress.
    pub fn reset(&mut self) {
        debug!("checkpoint invalidated; resetting progress");
        self.body = CheckpointBody::default();
        self.unsaved = false;
    }

    /// Records push progress: every local change up to `sequence` is
    /// replicated.
    pub fn update_local(&mut self, sequence: u64) {
        if sequence > self.body.local {
            self.body.local = sequence;
            self.unsaved = true;
        }
    }

    /// Records pull progress: the peer's changes up to `remote` are
    /// replicated.
    pub fn update_remote(&mut self, remote: &str) {
        if self.body.remote != remote {
            self.body.remote = remote.to_string();
            self.unsaved = true;
        }
    }

    /// True if progress has been recorded since the last completed save.
    pub fn is_unsaved(&self) -> bool {
        self.unsaved || self.saving
    }

    /// Begins a save: snapshots the body JSON and clears the unsaved flag.
    /// Progress recorded while the save is in flight marks the checkpoint
    /// unsaved again.
    pub fn begin_save(&mut self) -> Vec<u8> {
        self.unsaved = false;
        self.saving = true;
        self.body.to_json()
    }

    /// Marks the in-flight save finished (successfully or not).
    pub fn save_completed(&mut self) {
        self.saving = false;
    }
}

/// Derives the stable checkpoint ID for a `(database, peer, options)`
/// tuple: a digest over the private UUID, the canonical remote URL, and
/// the replication filters, in text form prefixed `"cp-"`.
fn derive_checkpoint_id(options: &ReplicatorOptions, db_uuid: [u8; 16]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(db_uuid);
    hasher.update([0]);
    hasher.update(options.remote_url.as_bytes());
    if let Some(doc_ids) = &options.doc_ids {
        let mut sorted: Vec<&String> = doc_ids.iter().collect();
        sorted.sort();
        for doc_id in sorted {
            hasher.update([0]);
            hasher.update(doc_id.as_bytes());
        }
    }
    for channel in &options.channels {
        hasher.update([1]);
        hasher.update(channel.as_bytes());
    }
    if let Some(filter) = &options.filter {
        hasher.update([2]);
        hasher.update(filter.as_bytes());
    }
    format!("cp-{}", BASE64.encode(&hasher.finalize()[..20]))
}

/// Outcome of a peer-checkpoint save attempt.
#[derive(Debug)]
pub enum PeerSaveError {
    /// The supplied rev token does not match the stored one.
    Mismatch,
    /// The stored rev token is unparseable.
    CorruptStoredRev,
    /// Storage failure.
    Store(StoreError),
}

/// Looks up a checkpoint a peer stored on this side.
pub fn get_peer_checkpoint(db: &DbAccess, client_id: &str) -> StoreResult<Option<RawDocument>> {
    db.use_store(|store| store.raw_get(PEER_CHECKPOINT_STORE, client_id))
}

/// Stores a peer's checkpoint with optimistic concurrency, returning the
/// new rev token.
pub fn save_peer_checkpoint(
    db: &DbAccess,
    client_id: &str,
    body: &[u8],
    expected_rev: &str,
) -> Result<String, PeerSaveError> {
    let existing = db
        .use_store(|store| store.raw_get(PEER_CHECKPOINT_STORE, client_id))
        .map_err(PeerSaveError::Store)?;

    let next = match existing {
        Some(doc) if !doc.meta.is_empty() => {
            let actual =
                PeerCheckpointRev::parse(&doc.meta).map_err(|_| PeerSaveError::CorruptStoredRev)?;
            if expected_rev != doc.meta {
                return Err(PeerSaveError::Mismatch);
            }
            actual.next()
        }
        _ => {
            if !expected_rev.is_empty() {
                return Err(PeerSaveError::Mismatch);
            }
            PeerCheckpointRev::first()
        }
    };

    let rev = next.to_string();
    db.use_store(|store| store.raw_put(PEER_CHECKPOINT_STORE, client_id, &rev, body))
        .map_err(PeerSaveError::Store)?;
    Ok(rev)
}
