//! The pull side: requests changes, receives revisions, tracks completion.

use crate::actor::ActorRef;
use crate::connection::{Connection, IncomingRequest, ReplyError};
use crate::delegate::{Direction, DocumentEnded};
use crate::error::SyncError;
use crate::inserter::{InserterState, RevToInsert};
use crate::options::{ReplMode, ReplicatorOptions};
use crate::replicator::{Child, ReplicatorState};
use crate::revfinder::RevFinderState;
use crate::status::{ActivityLevel, Progress, Status};
use crate::tuning;
use revsync_protocol::{profiles, ErrorResponse, Message};
use revsync_store::RemoteSequence;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One revision the peer was asked (or declined to be asked) for, in
/// announcement order. The checkpoint's remote sequence may not advance
/// past an entry until it completes.
#[derive(Debug)]
pub struct ExpectedRev {
    /// The peer's sequence for the change, if it announced one.
    pub remote_sequence: Option<RemoteSequence>,
    /// Announced body size (min 1), used as progress units.
    pub body_size: u64,
    /// True if the revision body was requested from the peer.
    pub requested: bool,
    /// Completion state.
    pub completed: bool,
}

/// The puller actor: subscribes to the peer's changes (when active),
/// accepts `rev`/`norev` messages, feeds the inserter, and owns the
/// in-flight revision accounting.
pub struct PullerState {
    replicator: ActorRef<ReplicatorState>,
    revfinder: ActorRef<RevFinderState>,
    inserter: ActorRef<InserterState>,
    connection: Arc<dyn Connection>,
    options: Arc<ReplicatorOptions>,
    active: bool,
    started: bool,
    caught_up: bool,
    skip_deleted: bool,
    expected: VecDeque<ExpectedRev>,
    inserts_in_flight: usize,
    progress: Progress,
    doc_count: u64,
    error: Option<SyncError>,
}

impl PullerState {
    /// Creates the puller.
    pub fn new(
        replicator: ActorRef<ReplicatorState>,
        revfinder: ActorRef<RevFinderState>,
        inserter: ActorRef<InserterState>,
        connection: Arc<dyn Connection>,
        options: Arc<ReplicatorOptions>,
    ) -> Self {
        let active = options.pull.is_active();
        Self {
            replicator,
            revfinder,
            inserter,
            connection,
            options,
            active,
            started: false,
            caught_up: false,
            skip_deleted: false,
            expected: VecDeque::new(),
            inserts_in_flight: 0,
            progress: Progress::default(),
            doc_count: 0,
            error: None,
        }
    }

    /// Pulling into an empty database with no checkpoint may skip deleted
    /// revisions in the initial dump.
    pub fn set_skip_deleted(&mut self) {
        self.skip_deleted = true;
    }

    /// Starts an active pull by subscribing to the peer's changes from the
    /// checkpointed remote sequence.
    pub fn start(&mut self, since: String) {
        if !self.active || self.started {
            return;
        }
        self.started = true;
        info!(since = %since, "subscribing to remote changes");

        let mut message = Message::request(profiles::SUB_CHANGES)
            .with_property("batch", tuning::CHANGES_BATCH_SIZE.to_string());
        if !since.is_empty() {
            message.set_property("since", since);
        }
        if self.options.pull == ReplMode::Continuous {
            message.set_property("continuous", "true");
        }
        if self.skip_deleted {
            message.set_property("activeOnly", "true");
        }
        if let Some(filter) = &self.options.filter {
            message.set_property("filter", filter.clone());
        }
        if !self.options.channels.is_empty() {
            message.set_property("channels", self.options.channels.join(","));
        }
        if let Some(doc_ids) = &self.options.doc_ids {
            let ids: Vec<&String> = doc_ids.iter().collect();
            message = message.with_json_body(&serde_json::json!({ "docIDs": ids }));
        }

        let replicator = self.replicator.clone();
        self.connection.send_request(
            message,
            Some(Box::new(move |result| {
                if let Err(ReplyError::Remote(e)) = result {
                    replicator.enqueue(move |r| r.on_error(SyncError::from(e)));
                }
            })),
        );
        self.report_status();
    }

    /// The RevFinder classified a changes batch; these entries are now
    /// expected, in order.
    pub fn expect_sequences(&mut self, batch: Vec<ExpectedRev>) {
        for mut entry in batch {
            self.progress.units_total += entry.body_size.max(1);
            if !entry.requested {
                entry.completed = true;
                self.progress.units_completed += entry.body_size.max(1);
            }
            self.expected.push_back(entry);
        }
        self.advance_remote_sequence();
        self.report_status();
    }

    /// The peer announced an empty change batch: we are caught up.
    pub fn caught_up(&mut self) {
        self.caught_up = true;
        self.report_status();
    }

    /// Handles an incoming `rev` message.
    pub fn handle_rev(&mut self, mut request: IncomingRequest) {
        let message = &request.message;
        let doc_id = message.property("id").unwrap_or_default().to_string();
        let rev_id = message.property("rev").unwrap_or_default().to_string();
        let deleted = message.bool_property("deleted");
        let remote_sequence = message
            .property("sequence")
            .map(|s| RemoteSequence::new(s.to_string()));

        if doc_id.is_empty() || rev_id.is_empty() {
            request.respond_error(ErrorResponse::blip(400, "rev message missing id/rev"));
            self.revfinder.enqueue(|finder| finder.rev_received());
            return;
        }

        // A rev whose sender couldn't read the body carries an error
        // property instead; the document ends here.
        if let Some(code) = message.int_property("error") {
            let error = SyncError::http(code as i32, "peer could not send revision");
            debug!(doc_id = %doc_id, rev_id = %rev_id, "rev arrived with error {code}");
            request.respond_ok();
            self.finish_expected(remote_sequence.as_ref());
            self.end_document(doc_id, rev_id, Some(error), false);
            self.revfinder.enqueue(|finder| finder.rev_received());
            self.report_status();
            return;
        }

        let body = match message.json_body() {
            Ok(serde_json::Value::Null) => None,
            Ok(json) => Some(json),
            Err(e) => {
                warn!(doc_id = %doc_id, "unparseable rev body: {e}");
                request.respond_error(ErrorResponse::blip(400, "invalid rev body"));
                self.finish_expected(remote_sequence.as_ref());
                self.end_document(
                    doc_id,
                    rev_id,
                    Some(SyncError::unexpected("unparseable revision body")),
                    false,
                );
                self.revfinder.enqueue(|finder| finder.rev_received());
                self.report_status();
                return;
            }
        };

        let mut history = vec![rev_id.clone()];
        if let Some(list) = message.property("history") {
            history.extend(list.split(',').map(str::to_string));
        }

        self.inserts_in_flight += 1;
        let rev = RevToInsert {
            doc_id,
            rev_id,
            history,
            deleted,
            body,
            remote_sequence,
            request: Some(request),
        };
        self.inserter.enqueue(move |inserter| inserter.insert(rev));
        self.report_status();
    }

    /// Handles an incoming `norev` message: the peer cannot send a
    /// revision it announced.
    pub fn handle_norev(&mut self, mut request: IncomingRequest) {
        let message = &request.message;
        let doc_id = message.property("id").unwrap_or_default().to_string();
        let rev_id = message.property("rev").unwrap_or_default().to_string();
        let code = message.int_property("error").unwrap_or(404) as i32;
        let remote_sequence = message
            .property("sequence")
            .map(|s| RemoteSequence::new(s.to_string()));

        debug!(doc_id = %doc_id, rev_id = %rev_id, "norev ({code})");
        request.respond_ok();
        self.finish_expected(remote_sequence.as_ref());
        self.end_document(
            doc_id,
            rev_id,
            Some(SyncError::http(code, "peer declined to send revision")),
            false,
        );
        self.revfinder.enqueue(|finder| finder.rev_received());
        self.report_status();
    }

    /// Outcome of one batched insert, delivered after its transaction
    /// committed.
    pub fn rev_completed(
        &mut self,
        mut rev: RevToInsert,
        error: Option<SyncError>,
        conflicted: bool,
    ) {
        self.inserts_in_flight = self.inserts_in_flight.saturating_sub(1);

        if let Some(request) = rev.request.as_mut() {
            match &error {
                None => request.respond_ok(),
                Some(e) if e.is_conflict() => {
                    request.respond_error(ErrorResponse::http(409, e.message.clone()))
                }
                Some(e) => request.respond_error(ErrorResponse::http(500, e.message.clone())),
            }
        }

        self.finish_expected(rev.remote_sequence.as_ref());

        if error.is_none() && conflicted {
            // The revision is durably inserted but created a conflict;
            // resolution is the application's job.
            self.end_document(
                rev.doc_id,
                rev.rev_id,
                Some(SyncError::conflict("document is now in conflict")),
                true,
            );
        } else {
            self.end_document(rev.doc_id, rev.rev_id, error, false);
        }

        self.revfinder.enqueue(|finder| finder.rev_received());
        self.report_status();
    }

    fn end_document(
        &mut self,
        doc_id: String,
        rev_id: String,
        error: Option<SyncError>,
        transient: bool,
    ) {
        if error.is_none() || transient {
            self.doc_count += 1;
        }
        let ended = DocumentEnded {
            doc_id,
            rev_id,
            direction: Direction::Pull,
            error,
            error_is_transient: transient,
        };
        self.replicator.enqueue(move |r| r.document_ended(ended));
    }

    /// Marks the matching expected entry complete and advances the remote
    /// checkpoint over the completed prefix.
    ///
    /// Entries from `proposeChanges` carry no sequence and are completed
    /// in arrival order.
    fn finish_expected(&mut self, remote_sequence: Option<&RemoteSequence>) {
        let slot = self.expected.iter_mut().find(|entry| {
            !entry.completed
                && match (remote_sequence, &entry.remote_sequence) {
                    (Some(seq), Some(expected)) => seq == expected,
                    (_, None) => true,
                    (None, Some(_)) => false,
                }
        });
        if let Some(entry) = slot {
            entry.completed = true;
            self.progress.units_completed += entry.body_size.max(1);
        }
        self.advance_remote_sequence();
    }

    fn advance_remote_sequence(&mut self) {
        let mut advanced: Option<RemoteSequence> = None;
        while matches!(self.expected.front(), Some(entry) if entry.completed) {
            if let Some(entry) = self.expected.pop_front() {
                if entry.remote_sequence.is_some() {
                    advanced = entry.remote_sequence;
                }
            }
        }
        if let Some(sequence) = advanced {
            self.replicator
                .enqueue(move |r| r.remote_progress(sequence));
        }
    }

    fn level(&self) -> ActivityLevel {
        let pending = self.inserts_in_flight > 0
            || self.expected.iter().any(|entry| !entry.completed);
        if pending || (self.active && (!self.started || !self.caught_up)) {
            ActivityLevel::Busy
        } else {
            ActivityLevel::Idle
        }
    }

    fn report_status(&mut self) {
        let status = Status {
            level: self.level(),
            progress: self.progress,
            error: self.error.clone(),
            doc_count: self.doc_count,
        };
        self.replicator
            .enqueue(move |r| r.child_status(Child::Puller, status));
    }

    /// Initial status announcement after spawn.
    pub fn announce(&mut self) {
        self.report_status();
    }
}
