//! Classification of incoming `changes` / `proposeChanges` messages.

use crate::actor::ActorRef;
use crate::connection::IncomingRequest;
use crate::options::ReplicatorOptions;
use crate::puller::{ExpectedRev, PullerState};
use crate::replicator::ReplicatorState;
use crate::tuning;
use revsync_protocol::{
    profiles, ChangesEntry, ChangesResponseWriter, ErrorResponse, Message, ProposedEntry,
    ResponseAnswer,
};
use revsync_store::{DbAccess, DocumentStore, RemoteId, RemoteSequence, RevId, VectorOrder};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The puller's front door: validates and classifies announced changes,
/// answers positionally, and gates how many revisions are requested at
/// once.
pub struct RevFinderState {
    replicator: ActorRef<ReplicatorState>,
    puller: ActorRef<PullerState>,
    db: Arc<DbAccess>,
    options: Arc<ReplicatorOptions>,
    remote: RemoteId,
    passive: bool,
    must_be_proposed: bool,
    waiting: VecDeque<IncomingRequest>,
    revs_being_requested: usize,
}

impl RevFinderState {
    /// Creates the RevFinder.
    pub fn new(
        replicator: ActorRef<ReplicatorState>,
        puller: ActorRef<PullerState>,
        db: Arc<DbAccess>,
        options: Arc<ReplicatorOptions>,
        remote: RemoteId,
    ) -> Self {
        let passive = !options.pull.is_active();
        let vv = db.store().using_version_vectors();
        let must_be_proposed = passive && options.no_incoming_conflicts && !vv;
        Self {
            replicator,
            puller,
            db,
            options,
            remote,
            passive,
            must_be_proposed,
            waiting: VecDeque::new(),
            revs_being_requested: 0,
        }
    }

    fn has_capacity(&self) -> bool {
        self.revs_being_requested <= tuning::MAX_REVS_IN_FLIGHT
    }

    /// Entry point for an incoming `changes`/`proposeChanges` request.
    /// Queued when too many revisions are already in flight.
    pub fn handle_changes(&mut self, request: IncomingRequest) {
        if self.has_capacity() {
            self.handle_changes_now(request);
        } else {
            debug!(queued = self.waiting.len() + 1, "queued changes message");
            self.waiting.push_back(request);
        }
    }

    /// A requested revision finished; drain queued changes messages while
    /// capacity allows.
    pub fn rev_received(&mut self) {
        self.revs_being_requested = self.revs_being_requested.saturating_sub(1);
        while !self.waiting.is_empty() && self.has_capacity() {
            if let Some(request) = self.waiting.pop_front() {
                self.handle_changes_now(request);
            }
        }
    }

    fn handle_changes_now(&mut self, mut request: IncomingRequest) {
        let proposed = request.message.profile() == Some(profiles::PROPOSE_CHANGES);
        let vv = self.db.store().using_version_vectors();

        let body = match request.message.json_body() {
            Ok(body) => body,
            Err(e) => {
                warn!("invalid changes body: {e}");
                request.respond_error(ErrorResponse::blip(400, "Invalid JSON body"));
                return;
            }
        };
        let entries: &[serde_json::Value] = match &body {
            serde_json::Value::Array(entries) => entries.as_slice(),
            serde_json::Value::Null => &[],
            _ => {
                request.respond_error(ErrorResponse::blip(400, "Invalid JSON body"));
                return;
            }
        };

        // In conflict-free mode with rev-trees the pusher must use
        // proposeChanges instead; with version vectors, always changes.
        if (!proposed && self.must_be_proposed) || (proposed && vv) {
            request.respond_error(ErrorResponse::blip(409, "wrong changes profile"));
            return;
        }

        if entries.is_empty() {
            info!("caught up with remote changes");
            self.puller.enqueue(|puller| puller.caught_up());
            request.respond_ok();
            return;
        }

        if request.no_reply() {
            warn!("ignoring noreply changes message with entries");
            return;
        }

        let mut response = Message::response().with_property(
            "maxHistory",
            self.db.store().max_history_depth().to_string(),
        );
        if !self.options.disable_blob_support {
            response.set_property("blobs", "true");
        }
        response.compressed = true;

        let mut writer = ChangesResponseWriter::new();
        let mut expected: Vec<ExpectedRev> = Vec::with_capacity(entries.len());
        let mut requested = 0usize;

        for (index, entry) in entries.iter().enumerate() {
            let answer = if proposed {
                match self.classify_proposed(index, entry) {
                    Ok((answer, entry_expected)) => {
                        if let Some(e) = entry_expected {
                            expected.push(e);
                            requested += 1;
                        }
                        answer
                    }
                    Err(error) => {
                        request.respond_error(error);
                        return;
                    }
                }
            } else {
                match self.classify_change(index, entry, vv) {
                    Ok((answer, entry_expected)) => {
                        if entry_expected.requested {
                            requested += 1;
                        }
                        expected.push(entry_expected);
                        answer
                    }
                    Err(error) => {
                        request.respond_error(error);
                        return;
                    }
                }
            };
            writer.push(&answer);
        }

        self.revs_being_requested += requested;
        debug!(
            entries = entries.len(),
            requested, proposed, "classified changes"
        );

        // The puller must know about the sequences before the peer can
        // react to the response, or early rev messages would be
        // unaccounted for.
        self.puller
            .enqueue(move |puller| puller.expect_sequences(expected));
        request.respond(response.with_body(writer.finish()));
    }

    /// Classifies one `changes` entry against local state.
    fn classify_change(
        &mut self,
        index: usize,
        entry: &serde_json::Value,
        vv: bool,
    ) -> Result<(ResponseAnswer, ExpectedRev), ErrorResponse> {
        let change = ChangesEntry::from_json(index, entry)
            .map_err(|e| ErrorResponse::blip(400, e.to_string()))?;
        validate_ids(&change.doc_id, &change.rev_id, vv)
            .map_err(|message| ErrorResponse::blip(400, message))?;

        let rev_id = RevId::parse(&change.rev_id)
            .map_err(|e| ErrorResponse::blip(400, e.to_string()))?;
        let remote_sequence = json_sequence(&change.sequence);

        let lookup = self
            .db
            .use_store(|store| {
                store.find_ancestors(
                    &change.doc_id,
                    &rev_id,
                    self.remote,
                    tuning::MAX_POSSIBLE_ANCESTORS,
                )
            })
            .map_err(|e| ErrorResponse::http(500, e.to_string()))?;

        let expected = |requested: bool| ExpectedRev {
            remote_sequence: remote_sequence.clone(),
            body_size: change.body_size.max(1),
            requested,
            completed: false,
        };

        if lookup.local_is_older {
            if lookup.conflict && self.passive {
                // Passive pullers refuse conflicting revisions.
                debug!(doc_id = %change.doc_id, rev_id = %change.rev_id, "rejecting conflict");
                return Ok((ResponseAnswer::Status(409), expected(false)));
            }
            let ancestors = lookup
                .ancestors
                .iter()
                .map(|rev| rev.to_string())
                .collect();
            return Ok((ResponseAnswer::Ancestors(ancestors), expected(true)));
        }

        if !lookup.at_this_remote {
            // We already have the revision but had not recorded that this
            // remote does too; record it and let the pusher suppress the
            // echo.
            let doc_id = change.doc_id.clone();
            let rev_string = change.rev_id.clone();
            if let Err(e) = self.db.use_store(|store| {
                store.set_remote_ancestor(&change.doc_id, &rev_id, self.remote)
            }) {
                warn!(doc_id = %doc_id, "failed to mark remote ancestor: {e}");
            } else {
                self.replicator
                    .enqueue(move |r| r.doc_remote_ancestor_changed(doc_id, rev_string));
            }
        }
        Ok((ResponseAnswer::NotWanted, expected(false)))
    }

    /// Classifies one `proposeChanges` entry. Accepted entries return an
    /// expected-rev record; rejected ones only a status.
    fn classify_proposed(
        &mut self,
        index: usize,
        entry: &serde_json::Value,
    ) -> Result<(ResponseAnswer, Option<ExpectedRev>), ErrorResponse> {
        let proposal = ProposedEntry::from_json(index, entry)
            .map_err(|e| ErrorResponse::blip(400, e.to_string()))?;
        validate_ids(&proposal.doc_id, &proposal.rev_id, false)
            .map_err(|message| ErrorResponse::blip(400, message))?;

        let status = self.proposed_status(&proposal);
        if status == 0 {
            debug!(doc_id = %proposal.doc_id, rev_id = %proposal.rev_id, "accepting proposal");
            let expected = ExpectedRev {
                remote_sequence: None,
                body_size: proposal.body_size.max(1),
                requested: true,
                completed: false,
            };
            Ok((ResponseAnswer::NotWanted, Some(expected)))
        } else {
            info!(
                doc_id = %proposal.doc_id,
                rev_id = %proposal.rev_id,
                status,
                "rejecting proposal"
            );
            Ok((ResponseAnswer::Status(status), None))
        }
    }

    /// Status for a proposed change: 0 accept, 304 already have,
    /// 409 conflict, 500 invalid.
    fn proposed_status(&self, proposal: &ProposedEntry) -> u16 {
        let info = match self
            .db
            .use_store(|store| store.get_document(&proposal.doc_id))
        {
            Ok(info) => info,
            Err(_) => return 500,
        };
        let current = info.as_ref().map(|i| i.rev_id.to_string());

        if current.as_deref() == Some(proposal.rev_id.as_str()) {
            return 304;
        }

        if self.db.store().using_version_vectors() {
            let Ok(theirs) = RevId::parse(&proposal.rev_id) else {
                return 500;
            };
            let Some(their_vector) = theirs.as_vector().cloned() else {
                return 500;
            };
            let Some(info) = info else {
                // New document; nothing to conflict with.
                return 0;
            };
            let Some(my_vector) = info.rev_id.as_vector() else {
                return 500;
            };
            return match their_vector.compare(my_vector) {
                VectorOrder::Same | VectorOrder::Older => 304,
                VectorOrder::Newer => 0,
                VectorOrder::Conflicting => 409,
            };
        }

        // Rev-trees.
        match (&info, &proposal.parent_rev_id) {
            (Some(i), Some(parent)) if &i.rev_id.to_string() == parent => 0,
            (Some(i), None) if i.flags.deleted => 0,
            (None, None) => 0,
            _ => 409,
        }
    }
}

/// Validates a wire docID/revID pair: docID length 1..=255; tree revIDs
/// must contain `-`, vector revIDs must contain `@` in absolute form.
fn validate_ids(doc_id: &str, rev_id: &str, vv: bool) -> Result<(), String> {
    if doc_id.is_empty() || doc_id.len() > 255 {
        return Err(format!("invalid docID '{doc_id}' in change list"));
    }
    let valid = if vv {
        rev_id.contains('@') && !rev_id.contains('*')
    } else {
        rev_id.contains('-')
    };
    if !valid {
        return Err(format!(
            "invalid docID/revID '{doc_id}' #{rev_id} in change list"
        ));
    }
    Ok(())
}

/// Extracts the opaque remote sequence from a changes-entry slot.
fn json_sequence(value: &serde_json::Value) -> Option<RemoteSequence> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(RemoteSequence::new(s.clone())),
        serde_json::Value::Number(n) => Some(RemoteSequence::new(n.to_string())),
        other => Some(RemoteSequence::new(other.to_string())),
    }
}
