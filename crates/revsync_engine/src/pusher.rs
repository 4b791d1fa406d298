//! The push side: enumerates local changes and sends revisions.

use crate::actor::ActorRef;
use crate::connection::{Connection, IncomingRequest, ReplyError};
use crate::delegate::{Direction, DocumentEnded};
use crate::error::SyncError;
use crate::options::{ReplMode, ReplicatorOptions};
use crate::replicator::{Child, ReplicatorState};
use crate::status::{ActivityLevel, Progress, Status};
use crate::tuning;
use revsync_codec::Decoder;
use revsync_protocol::{
    profiles, ChangesEntry, ChangesResponse, ErrorResponse, Message, ProposedEntry,
    ResponseAnswer,
};
use revsync_store::{
    Change, DbAccess, DocumentStore, ForeignAncestor, RemoteId, RevId, Sequence,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One announced change awaiting its outcome.
struct PendingChange {
    doc_id: String,
    completed: bool,
}

/// Metadata about a change we announced, kept until the peer's positional
/// answer arrives.
#[derive(Clone)]
struct SentChange {
    sequence: Sequence,
    doc_id: String,
    rev_id: String,
    deleted: bool,
    body_size: u64,
}

/// The pusher actor: enumerates local changes in sequence order, announces
/// them in batches, sends the wanted revision bodies, and drives the local
/// side of the checkpoint.
pub struct PusherState {
    self_ref: ActorRef<PusherState>,
    replicator: ActorRef<ReplicatorState>,
    connection: Arc<dyn Connection>,
    db: Arc<DbAccess>,
    options: Arc<ReplicatorOptions>,
    remote: RemoteId,
    active: bool,
    continuous: bool,
    proposing: bool,
    started: bool,
    caught_up: bool,
    skip_deleted: bool,
    since: Sequence,
    session_start: Sequence,
    checkpoint_floor: Sequence,
    max_history: usize,
    changes_in_flight: usize,
    revs_in_flight: usize,
    pending: BTreeMap<Sequence, PendingChange>,
    /// Revisions the peer told us it already has, learned out of band.
    known_at_remote: HashSet<(String, String)>,
    doc_id_filter: Option<HashSet<String>>,
    observer_stop: Option<Arc<AtomicBool>>,
    progress: Progress,
    doc_count: u64,
    error: Option<SyncError>,
}

impl PusherState {
    /// Creates the pusher.
    pub fn new(
        self_ref: ActorRef<PusherState>,
        replicator: ActorRef<ReplicatorState>,
        connection: Arc<dyn Connection>,
        db: Arc<DbAccess>,
        options: Arc<ReplicatorOptions>,
        remote: RemoteId,
    ) -> Self {
        let active = options.push.is_active();
        let continuous = options.push == ReplMode::Continuous;
        let proposing = options.propose_changes;
        let doc_id_filter = options.doc_ids.clone();
        Self {
            self_ref,
            replicator,
            connection,
            db,
            options,
            remote,
            active,
            continuous,
            proposing,
            started: false,
            caught_up: false,
            skip_deleted: false,
            since: 0,
            session_start: 0,
            checkpoint_floor: 0,
            max_history: tuning::DEFAULT_MAX_HISTORY,
            changes_in_flight: 0,
            revs_in_flight: 0,
            pending: BTreeMap::new(),
            known_at_remote: HashSet::new(),
            doc_id_filter,
            observer_stop: None,
            progress: Progress::default(),
            doc_count: 0,
            error: None,
        }
    }

    /// Starts pushing from `since` (the checkpointed local sequence).
    pub fn start(&mut self, since: Sequence) {
        if self.started {
            return;
        }
        self.started = true;
        self.since = since;
        self.session_start = since + 1;
        self.checkpoint_floor = since;
        info!(since, proposing = self.proposing, "starting push");
        self.enumerate_next();
        self.report_status();
    }

    /// Handles a `subChanges` subscription from an active puller on the
    /// peer; turns this (passive) pusher on.
    pub fn handle_sub_changes(&mut self, mut request: IncomingRequest) {
        let message = &request.message;
        let since = message
            .property("since")
            .and_then(|s| s.parse::<Sequence>().ok())
            .unwrap_or(0);
        self.continuous = self.continuous || message.bool_property("continuous");
        self.skip_deleted = message.bool_property("activeOnly");
        if let Ok(body) = message.json_body() {
            if let Some(ids) = body.get("docIDs").and_then(|v| v.as_array()) {
                self.doc_id_filter = Some(
                    ids.iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .collect(),
                );
            }
        }
        if let Some(filter) = message.property("filter") {
            // Named server-side filters are not supported.
            warn!(filter, "unsupported changes filter requested");
            request.respond_error(ErrorResponse::http(501, "filter not supported"));
            return;
        }
        info!(since, continuous = self.continuous, "peer subscribed to changes");
        request.respond_ok();
        self.started = false;
        self.start(since);
    }

    /// A revision the peer announced turned out to exist locally already;
    /// it must not be echoed back.
    pub fn doc_remote_ancestor_changed(&mut self, doc_id: String, rev_id: String) {
        self.known_at_remote.insert((doc_id, rev_id));
    }

    fn passes_filter(&self, change: &Change) -> bool {
        if let Some(filter) = &self.doc_id_filter {
            if !filter.contains(&change.doc_id) {
                return false;
            }
        }
        if !self.options.passes_doc_filter(&change.doc_id) {
            return false;
        }
        true
    }

    /// True if the peer is already known to hold this exact revision.
    fn peer_has(&self, change: &Change) -> bool {
        if self
            .known_at_remote
            .contains(&(change.doc_id.clone(), change.rev_id.to_string()))
        {
            return true;
        }
        self.db
            .use_store(|store| {
                store.find_ancestors(&change.doc_id, &change.rev_id, self.remote, 0)
            })
            .map(|lookup| !lookup.local_is_older && lookup.at_this_remote)
            .unwrap_or(false)
    }

    fn enumerate_next(&mut self) {
        loop {
            let batch = match self.db.use_store(|store| {
                store.changes_since(self.since, tuning::CHANGES_BATCH_SIZE, self.skip_deleted)
            }) {
                Ok(batch) => batch,
                Err(e) => {
                    let error: SyncError = e.into();
                    self.error = Some(error.clone());
                    self.replicator.enqueue(move |r| r.on_error(error));
                    return;
                }
            };
            let raw_len = batch.len();
            if let Some(last) = batch.last() {
                self.since = last.sequence;
            }
            debug!(count = raw_len, since = self.since, "enumerated changes");

            self.announce_changes(batch);

            if raw_len < tuning::CHANGES_BATCH_SIZE {
                // End of the feed.
                if !self.caught_up {
                    self.caught_up = true;
                    self.send_caught_up();
                    if self.continuous {
                        self.start_observer();
                    }
                }
                self.advance_checkpoint();
                self.report_status();
                return;
            }
            if self.changes_in_flight > 0 {
                // Next batch is enumerated when this one is answered.
                return;
            }
            // Entire batch was filtered out; keep going.
        }
    }

    /// Announces a batch of changes (from enumeration or the observer).
    fn announce_changes(&mut self, batch: Vec<Change>) {
        let mut entries: Vec<serde_json::Value> = Vec::new();
        let mut sent: Vec<SentChange> = Vec::new();

        for change in batch {
            if change.sequence > self.since {
                self.since = change.sequence;
            }
            if !self.passes_filter(&change) {
                continue;
            }
            if self.peer_has(&change) {
                self.pending.insert(
                    change.sequence,
                    PendingChange {
                        doc_id: change.doc_id.clone(),
                        completed: true,
                    },
                );
                continue;
            }

            let rev_string = change.rev_id.to_string();
            if self.proposing {
                match self
                    .db
                    .use_store(|store| {
                        store.foreign_ancestor_of(&change.doc_id, self.session_start)
                    }) {
                    Ok(ForeignAncestor::SkipForeignLeaf) => {
                        self.pending.insert(
                            change.sequence,
                            PendingChange {
                                doc_id: change.doc_id.clone(),
                                completed: true,
                            },
                        );
                        continue;
                    }
                    Ok(ForeignAncestor::Ancestor(parent)) => {
                        entries.push(
                            ProposedEntry {
                                doc_id: change.doc_id.clone(),
                                rev_id: rev_string.clone(),
                                parent_rev_id: parent.map(|rev| rev.to_string()),
                                body_size: change.body_size,
                            }
                            .to_json(),
                        );
                    }
                    Err(e) => {
                        warn!(doc_id = %change.doc_id, "foreign-ancestor walk failed: {e}");
                        self.end_document(
                            change.doc_id.clone(),
                            rev_string.clone(),
                            Some(e.into()),
                        );
                        self.pending.insert(
                            change.sequence,
                            PendingChange {
                                doc_id: change.doc_id.clone(),
                                completed: true,
                            },
                        );
                        continue;
                    }
                }
            } else {
                entries.push(
                    ChangesEntry {
                        sequence: serde_json::json!(change.sequence),
                        doc_id: change.doc_id.clone(),
                        rev_id: rev_string.clone(),
                        deleted: change.deleted,
                        body_size: change.body_size,
                    }
                    .to_json(),
                );
            }

            self.progress.units_total += change.body_size.max(1);
            self.pending.insert(
                change.sequence,
                PendingChange {
                    doc_id: change.doc_id.clone(),
                    completed: false,
                },
            );
            sent.push(SentChange {
                sequence: change.sequence,
                doc_id: change.doc_id,
                rev_id: rev_string,
                deleted: change.deleted,
                body_size: change.body_size,
            });
        }

        if sent.is_empty() {
            self.advance_checkpoint();
            return;
        }

        let profile = if self.proposing {
            profiles::PROPOSE_CHANGES
        } else {
            profiles::CHANGES
        };
        let message =
            Message::request(profile).with_json_body(&serde_json::Value::Array(entries));

        self.changes_in_flight += 1;
        let me = self.self_ref.clone();
        self.connection.send_request(
            message,
            Some(Box::new(move |reply| {
                me.enqueue(move |pusher| pusher.handle_changes_response(sent, reply));
            })),
        );
        self.report_status();
    }

    /// Tells the peer the change feed is (for now) exhausted.
    fn send_caught_up(&mut self) {
        info!("caught up with local changes");
        let message = Message::request(profiles::CHANGES)
            .with_json_body(&serde_json::Value::Array(Vec::new()));
        self.changes_in_flight += 1;
        let me = self.self_ref.clone();
        self.connection.send_request(
            message,
            Some(Box::new(move |_reply| {
                me.enqueue(|pusher| {
                    pusher.changes_in_flight = pusher.changes_in_flight.saturating_sub(1);
                    pusher.report_status();
                });
            })),
        );
    }

    fn handle_changes_response(
        &mut self,
        sent: Vec<SentChange>,
        reply: Result<Message, ReplyError>,
    ) {
        self.changes_in_flight = self.changes_in_flight.saturating_sub(1);

        let response = match reply {
            Ok(response) => response,
            Err(ReplyError::Remote(e)) => {
                warn!("changes message rejected: {e}");
                let error = SyncError::from(e);
                for change in &sent {
                    self.end_document(
                        change.doc_id.clone(),
                        change.rev_id.clone(),
                        Some(error.clone()),
                    );
                    self.complete_sequence(change.sequence);
                }
                self.error = Some(error.clone());
                self.replicator.enqueue(move |r| r.on_error(error));
                self.report_status();
                return;
            }
            Err(ReplyError::Disconnected) => return,
        };

        if let Some(depth) = response.int_property("maxHistory") {
            self.max_history = (depth.max(1)) as usize;
        }

        let answers = match response
            .json_body()
            .and_then(|body| ChangesResponse::parse(&body, sent.len()))
        {
            Ok(parsed) => parsed.answers,
            Err(e) => {
                let error = SyncError::unexpected(format!("bad changes response: {e}"));
                self.replicator.enqueue({
                    let error = error.clone();
                    move |r| r.on_error(error)
                });
                self.error = Some(error);
                return;
            }
        };

        for (change, answer) in sent.into_iter().zip(answers) {
            match answer {
                ResponseAnswer::NotWanted => {
                    if !self.proposing {
                        // The peer already has it; remember that.
                        self.mark_synced(&change);
                        self.progress.units_completed += change.body_size.max(1);
                        self.complete_sequence(change.sequence);
                    } else {
                        // Proposal accepted; send the body.
                        self.send_revision(change, Vec::new());
                    }
                }
                ResponseAnswer::Status(code) => {
                    let error = if code == 409 {
                        SyncError::conflict("peer rejected revision as conflict")
                    } else if code == 304 {
                        // Peer already has it; not an error.
                        self.mark_synced(&change);
                        self.progress.units_completed += change.body_size.max(1);
                        self.complete_sequence(change.sequence);
                        continue;
                    } else {
                        SyncError::http(i32::from(code), "peer rejected revision")
                    };
                    self.end_document(change.doc_id.clone(), change.rev_id.clone(), Some(error));
                    self.progress.units_completed += change.body_size.max(1);
                    self.complete_sequence(change.sequence);
                }
                ResponseAnswer::Ancestors(ancestors) => {
                    self.send_revision(change, ancestors);
                }
            }
        }

        if !self.caught_up && self.changes_in_flight == 0 {
            self.enumerate_next();
        }
        self.report_status();
    }

    /// Sends one `rev` message carrying the revision body and the history
    /// back to the deepest ancestor the peer reported having.
    fn send_revision(&mut self, change: SentChange, ancestors: Vec<String>) {
        self.revs_in_flight += 1;

        let rev_id = match RevId::parse(&change.rev_id) {
            Ok(rev_id) => rev_id,
            Err(e) => {
                self.revs_in_flight -= 1;
                self.end_document(change.doc_id.clone(), change.rev_id, Some(e.into()));
                self.complete_sequence(change.sequence);
                return;
            }
        };

        let stop_set: Vec<RevId> = ancestors
            .iter()
            .filter_map(|rev| RevId::parse(rev).ok())
            .collect();

        let shared_keys = self.db.store().shared_keys();
        let (body_json, error_code) = match self.db.use_store(|store| {
            store.get_revision(&change.doc_id, &rev_id)
        }) {
            Ok(Some(info)) => match info.body {
                Some(bytes) => {
                    match Decoder::new(Some(&shared_keys))
                        .decode(&bytes)
                        .and_then(|value| value.to_json())
                    {
                        Ok(json) => (Some(json), None),
                        Err(e) => {
                            warn!(doc_id = %change.doc_id, "unreadable revision body: {e}");
                            (None, Some(500))
                        }
                    }
                }
                None => (None, if change.deleted { None } else { Some(404) }),
            },
            Ok(None) => (None, Some(404)),
            Err(_) => (None, Some(500)),
        };

        let history = self
            .db
            .use_store(|store| {
                store.rev_history(&change.doc_id, &rev_id, self.max_history, &stop_set)
            })
            .unwrap_or_default();

        let mut message = Message::request(profiles::REV)
            .with_property("id", change.doc_id.clone())
            .with_property("rev", change.rev_id.clone())
            .with_property("sequence", change.sequence.to_string());
        if change.deleted {
            message.set_property("deleted", "1");
        }
        if !history.is_empty() {
            let joined: Vec<String> = history.iter().map(|rev| rev.to_string()).collect();
            message.set_property("history", joined.join(","));
        }
        if let Some(code) = error_code {
            message.set_property("error", code.to_string());
        } else if let Some(json) = &body_json {
            let body = json.to_string();
            message.compressed = body.len() >= tuning::MIN_BODY_SIZE_TO_COMPRESS;
            message.body = body.into_bytes();
        }

        debug!(doc_id = %change.doc_id, rev_id = %change.rev_id, "sending revision");
        let me = self.self_ref.clone();
        self.connection.send_request(
            message,
            Some(Box::new(move |reply| {
                me.enqueue(move |pusher| pusher.handle_rev_response(change, reply));
            })),
        );
    }

    fn handle_rev_response(&mut self, change: SentChange, reply: Result<Message, ReplyError>) {
        self.revs_in_flight = self.revs_in_flight.saturating_sub(1);
        match reply {
            Ok(_) => {
                self.mark_synced(&change);
                self.doc_count += 1;
                self.end_document(change.doc_id.clone(), change.rev_id.clone(), None);
            }
            Err(ReplyError::Remote(e)) => {
                self.end_document(
                    change.doc_id.clone(),
                    change.rev_id.clone(),
                    Some(SyncError::from(e)),
                );
            }
            Err(ReplyError::Disconnected) => {}
        }
        self.progress.units_completed += change.body_size.max(1);
        self.complete_sequence(change.sequence);
        self.report_status();
    }

    /// Records that the peer now holds this revision.
    fn mark_synced(&self, change: &SentChange) {
        if let Ok(rev_id) = RevId::parse(&change.rev_id) {
            let result = self.db.use_store(|store| {
                store.set_remote_ancestor(&change.doc_id, &rev_id, self.remote)
            });
            if let Err(e) = result {
                debug!(doc_id = %change.doc_id, "could not mark revision synced: {e}");
            }
        }
    }

    fn end_document(&mut self, doc_id: String, rev_id: String, error: Option<SyncError>) {
        let ended = DocumentEnded {
            doc_id,
            rev_id,
            direction: Direction::Push,
            error,
            error_is_transient: false,
        };
        self.replicator.enqueue(move |r| r.document_ended(ended));
    }

    fn complete_sequence(&mut self, sequence: Sequence) {
        if let Some(entry) = self.pending.get_mut(&sequence) {
            entry.completed = true;
        }
        self.advance_checkpoint();
    }

    /// Advances the local checkpoint over the completed prefix of
    /// announced changes.
    fn advance_checkpoint(&mut self) {
        while self
            .pending
            .first_key_value()
            .is_some_and(|(_, entry)| entry.completed)
        {
            self.pending.pop_first();
        }
        let floor = match self.pending.keys().next() {
            Some(&first_incomplete) => first_incomplete.saturating_sub(1),
            None if self.started => self.since,
            None => 0,
        };
        if floor > self.checkpoint_floor {
            self.checkpoint_floor = floor;
            let floor_copy = floor;
            self.replicator
                .enqueue(move |r| r.local_progress(floor_copy));
        }
    }

    /// Starts observing the tracker for future changes (continuous mode).
    fn start_observer(&mut self) {
        if self.observer_stop.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        self.observer_stop = Some(stop.clone());

        let tracker = self.db.store().tracker();
        let mut observer = tracker.observe(self.since, self.db.handle().0);
        let me = self.self_ref.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if !observer.wait(Duration::from_millis(250)) {
                    continue;
                }
                loop {
                    let read = observer.read_changes(100);
                    if read.overflow {
                        me.enqueue(|pusher| pusher.enumerate_next());
                        break;
                    }
                    if read.changes.is_empty() {
                        break;
                    }
                    let changes = read.changes;
                    me.enqueue(move |pusher| {
                        // Live changes include tombstones regardless of the
                        // initial dump's activeOnly setting.
                        pusher.announce_changes(changes);
                        pusher.report_status();
                    });
                }
            }
        });
    }

    /// Stops the change observer, if any.
    pub fn stop_observing(&mut self) {
        if let Some(stop) = self.observer_stop.take() {
            stop.store(true, Ordering::Relaxed);
        }
    }

    /// Document IDs announced but not yet pushed, plus changes not yet
    /// enumerated.
    pub fn pending_doc_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pending
            .values()
            .filter(|entry| !entry.completed)
            .map(|entry| entry.doc_id.clone())
            .collect();
        if let Ok(batch) = self.db.use_store(|store| {
            store.changes_since(self.since, tuning::CHANGES_BATCH_SIZE, false)
        }) {
            for change in batch {
                if self.passes_filter(&change) {
                    ids.push(change.doc_id);
                }
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }

    fn level(&self) -> ActivityLevel {
        let busy = self.changes_in_flight > 0
            || self.revs_in_flight > 0
            || self.pending.values().any(|entry| !entry.completed)
            || (self.active && (!self.started || !self.caught_up));
        if busy {
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
            .enqueue(move |r| r.child_status(Child::Pusher, status));
    }

    /// Initial status announcement after spawn.
    pub fn announce(&mut self) {
        self.report_status();
    }
}
