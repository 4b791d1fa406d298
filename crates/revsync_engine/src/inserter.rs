//! Batched transactional insertion of incoming revisions.

use crate::actor::ActorRef;
use crate::connection::IncomingRequest;
use crate::error::SyncError;
use crate::puller::PullerState;
use crate::tuning;
use parking_lot::Mutex;
use revsync_codec::{Encoder, Value};
use revsync_store::{
    DbAccess, DocumentStore, PutRequest, RemoteId, RemoteSequence, RevFlags, RevId,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// One incoming revision, alive from the `rev` message's arrival until the
/// insert transaction commits and the outcome is reported.
pub struct RevToInsert {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID, in wire form.
    pub rev_id: String,
    /// Full history, newest first; the first entry is `rev_id`.
    pub history: Vec<String>,
    /// Whether the revision is a deletion.
    pub deleted: bool,
    /// The revision body as received (JSON), if readable.
    pub body: Option<serde_json::Value>,
    /// The sender's sequence for this revision, for checkpoint accounting.
    pub remote_sequence: Option<RemoteSequence>,
    /// The originating `rev` request, answered after the insert.
    pub request: Option<IncomingRequest>,
}

/// Collects incoming revisions and applies them in batched transactions.
///
/// Each deposit arms a short timer; when it fires, the queue is drained
/// atomically and the whole batch is inserted inside one write transaction.
/// A failing revision is recorded and skipped; it does not abort the batch.
/// A failing commit is inherited by every revision in the batch.
pub struct InserterState {
    self_ref: ActorRef<InserterState>,
    puller: ActorRef<PullerState>,
    db: Arc<DbAccess>,
    remote: RemoteId,
    queue: Arc<Mutex<Vec<RevToInsert>>>,
}

impl InserterState {
    /// Creates the inserter.
    pub fn new(
        self_ref: ActorRef<InserterState>,
        puller: ActorRef<PullerState>,
        db: Arc<DbAccess>,
        remote: RemoteId,
    ) -> Self {
        Self {
            self_ref,
            puller,
            db,
            remote,
            queue: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Deposits a revision; the first deposit arms the batch timer.
    pub fn insert(&mut self, rev: RevToInsert) {
        let arm_timer = {
            let mut queue = self.queue.lock();
            queue.push(rev);
            queue.len() == 1
        };
        if arm_timer {
            self.self_ref
                .enqueue_after(tuning::INSERTION_DELAY, |state| state.insert_now());
        }
    }

    fn insert_now(&mut self) {
        let revs: Vec<RevToInsert> = std::mem::take(&mut *self.queue.lock());
        if revs.is_empty() {
            return;
        }
        debug!(count = revs.len(), "inserting revision batch");
        let started = Instant::now();

        let shared_keys = self.db.store().shared_keys();
        let store = self.db.store().clone();
        let remote = self.remote;

        // Per-rev outcome: error (if any) and whether the doc is now in
        // conflict.
        let mut outcomes: Vec<(Option<SyncError>, bool)> = Vec::with_capacity(revs.len());

        let commit_result = self.db.in_transaction(&mut || {
            for rev in &revs {
                let prepared = prepare_put(rev, &shared_keys, remote);
                match prepared {
                    Ok(request) => match store.insert_existing_revision(&request) {
                        Ok(outcome) => outcomes.push((None, outcome.conflicted)),
                        Err(e) => {
                            if !revsync_store::warnings_suppressed() {
                                warn!(
                                    doc_id = %rev.doc_id,
                                    rev_id = %rev.rev_id,
                                    "failed to insert: {e}"
                                );
                            }
                            outcomes.push((Some(e.into()), false));
                        }
                    },
                    Err(e) => {
                        if !revsync_store::warnings_suppressed() {
                            warn!(doc_id = %rev.doc_id, "unusable incoming revision: {e}");
                        }
                        outcomes.push((Some(e), false));
                    }
                }
            }
            Ok(())
        });

        let commit_error: Option<SyncError> = match commit_result {
            Ok(()) => None,
            Err(e) => {
                warn!("insert transaction failed: {e}");
                Some(e.into())
            }
        };

        debug!(
            count = revs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "insert batch done"
        );

        // Report after commit, per-rev errors first, commit error for the
        // rest.
        for (rev, (rev_error, conflicted)) in revs.into_iter().zip(outcomes) {
            let error = rev_error.or_else(|| commit_error.clone());
            self.puller
                .enqueue(move |puller| puller.rev_completed(rev, error, conflicted));
        }
    }
}

/// Builds the store put request for one incoming revision: parses the
/// history list and re-encodes the body through the target store's shared
/// keys so downstream key lookups resolve.
fn prepare_put(
    rev: &RevToInsert,
    shared_keys: &Arc<revsync_codec::SharedKeys>,
    remote: RemoteId,
) -> Result<PutRequest, SyncError> {
    let mut history = Vec::with_capacity(rev.history.len());
    for entry in &rev.history {
        history.push(RevId::parse(entry).map_err(SyncError::from)?);
    }

    let body = match &rev.body {
        Some(json) => {
            let value = Value::from_json(json)
                .map_err(|e| SyncError::unexpected(format!("bad body: {e}")))?;
            Encoder::new(Some(shared_keys.clone()))
                .encode(&value)
                .map_err(|e| SyncError::unexpected(format!("re-encode failed: {e}")))?
        }
        None => Vec::new(),
    };

    Ok(PutRequest {
        doc_id: rev.doc_id.clone(),
        body,
        history,
        rev_flags: RevFlags::none().deleted(rev.deleted).foreign(true),
        allow_conflict: true,
        remote: Some(remote),
    })
}
