//! The replication session coordinator.

use crate::actor::{ActorRef, Mailbox};
use crate::checkpointer::{
    get_peer_checkpoint, save_peer_checkpoint, Checkpointer, PeerSaveError,
};
use crate::connection::{
    CloseCode, CloseStatus, Connection, ConnectionDelegate, ConnectionState, IncomingRequest,
    ReplyError,
};
use crate::delegate::{Direction, DocumentEnded, ReplicatorDelegate};
use crate::error::{stopping_severity, ws_codes, StoppingSeverity, SyncError, SyncResult};
use crate::inserter::InserterState;
use crate::options::{ReplMode, ReplicatorOptions};
use crate::puller::PullerState;
use crate::pusher::PusherState;
use crate::revfinder::RevFinderState;
use crate::status::{ActivityLevel, Status};
use crate::tuning;
use revsync_protocol::{profiles, CheckpointBody, ErrorResponse, Message};
use revsync_store::{DbAccess, DocumentStore, RemoteId, RemoteSequence};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Which sub-actor a status report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    /// The push side.
    Pusher,
    /// The pull side.
    Puller,
}

/// How many document outcomes are batched before the delegate is notified
/// outside a status report.
const DOCS_ENDED_BATCH: usize = 100;

/// A bidirectional replication session between the local store and one
/// peer.
///
/// Created per session; transitions Stopped → Connecting → Connected →
/// (Busy ↔ Idle) → Closing → Stopped exactly once. All public methods
/// enqueue onto the session's mailbox and return immediately.
pub struct Replicator {
    actor: ActorRef<ReplicatorState>,
}

impl Replicator {
    /// Creates a session over `connection`. Does not connect yet.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        connection: Arc<dyn Connection>,
        delegate: Arc<dyn ReplicatorDelegate>,
        options: ReplicatorOptions,
    ) -> SyncResult<Replicator> {
        let options = Arc::new(options);
        let db = Arc::new(DbAccess::new(store));
        let remote = db.use_store(|store| store.remote_id(&options.remote_url))?;
        let uuid = db.store().private_uuid();

        let (replicator_ref, replicator_mailbox) = Mailbox::new("replicator");
        let (pusher_ref, pusher_mailbox) = Mailbox::new("pusher");
        let (puller_ref, puller_mailbox) = Mailbox::new("puller");
        let (finder_ref, finder_mailbox) = Mailbox::new("revfinder");
        let (inserter_ref, inserter_mailbox) = Mailbox::new("inserter");

        pusher_mailbox.run(PusherState::new(
            pusher_ref.clone(),
            replicator_ref.clone(),
            connection.clone(),
            db.clone(),
            options.clone(),
            remote,
        ));
        inserter_mailbox.run(InserterState::new(
            inserter_ref.clone(),
            puller_ref.clone(),
            db.clone(),
            remote,
        ));
        puller_mailbox.run(PullerState::new(
            replicator_ref.clone(),
            finder_ref.clone(),
            inserter_ref.clone(),
            connection.clone(),
            options.clone(),
        ));
        finder_mailbox.run(RevFinderState::new(
            replicator_ref.clone(),
            puller_ref.clone(),
            db.clone(),
            options.clone(),
            remote,
        ));

        let push_status = Status::at(if options.push == ReplMode::Disabled {
            ActivityLevel::Stopped
        } else {
            ActivityLevel::Busy
        });
        let pull_status = Status::at(if options.pull == ReplMode::Disabled {
            ActivityLevel::Stopped
        } else {
            ActivityLevel::Busy
        });

        let checkpointer = Checkpointer::new(&options, uuid);
        let state = ReplicatorState {
            self_ref: replicator_ref.clone(),
            options,
            db,
            connection,
            delegate: Some(delegate),
            pusher: pusher_ref,
            puller: puller_ref,
            revfinder: finder_ref,
            inserter: inserter_ref,
            remote,
            checkpointer,
            connection_state: ConnectionState::Closed,
            push_status,
            pull_status,
            status: Status::default(),
            session_error: None,
            started_replicating: false,
            had_local_checkpoint: false,
            remote_checkpoint_requested: false,
            remote_checkpoint_received: false,
            remote_checkpoint_rev: String::new(),
            checkpoint_json_to_save: None,
            autosave_scheduled: false,
            close_initiated: false,
            last_delegate_level: None,
            last_delegate_call: None,
            waiting_to_call_delegate: false,
            docs_ended: Vec::new(),
            stopped: false,
        };
        replicator_mailbox.run(state);

        Ok(Replicator {
            actor: replicator_ref,
        })
    }

    /// Starts the session. With `reset`, the local checkpoint is ignored
    /// and everything re-enumerates from the beginning.
    pub fn start(&self, reset: bool) {
        self.actor.enqueue(move |r| r.start_session(reset));
    }

    /// Requests a graceful close. Idempotent.
    pub fn stop(&self) {
        self.actor.enqueue(|r| r.request_stop());
    }

    /// Hard-releases the session: the delegate will not be called again.
    /// Call only after observing `Stopped`.
    pub fn terminate(&self) {
        self.actor.enqueue(|r| r.terminate());
    }

    /// Reports the document IDs the push side has yet to send.
    pub fn pending_document_ids(&self, callback: Box<dyn FnOnce(Vec<String>) + Send>) {
        self.actor
            .enqueue(move |r| callback(r.pending_document_ids()));
    }

    /// Reports whether one document is still pending on the push side.
    pub fn is_document_pending(&self, doc_id: String, callback: Box<dyn FnOnce(bool) + Send>) {
        self.actor
            .enqueue(move |r| callback(r.pending_document_ids().contains(&doc_id)));
    }
}

/// Forwards transport callbacks onto the session mailbox.
struct ConnectionEvents {
    actor: ActorRef<ReplicatorState>,
}

impl ConnectionDelegate for ConnectionEvents {
    fn on_connect(&self) {
        self.actor.enqueue(|r| r.on_connect());
    }

    fn on_http_response(&self, status: u16, headers: &[(String, String)]) {
        let headers = headers.to_vec();
        self.actor
            .enqueue(move |r| r.on_http_response(status, headers));
    }

    fn on_tls_certificate(&self, cert: &[u8]) {
        let cert = cert.to_vec();
        self.actor.enqueue(move |r| r.on_tls_certificate(cert));
    }

    fn on_request(&self, request: IncomingRequest) {
        self.actor.enqueue(move |r| r.on_request(request));
    }

    fn on_close(&self, status: CloseStatus, state: ConnectionState) {
        self.actor.enqueue(move |r| r.on_close(status, state));
    }
}

/// Mailbox state of the session coordinator.
pub struct ReplicatorState {
    self_ref: ActorRef<ReplicatorState>,
    options: Arc<ReplicatorOptions>,
    db: Arc<DbAccess>,
    connection: Arc<dyn Connection>,
    delegate: Option<Arc<dyn ReplicatorDelegate>>,
    pusher: ActorRef<PusherState>,
    puller: ActorRef<PullerState>,
    revfinder: ActorRef<RevFinderState>,
    inserter: ActorRef<InserterState>,
    #[allow(dead_code)]
    remote: RemoteId,
    checkpointer: Checkpointer,
    connection_state: ConnectionState,
    push_status: Status,
    pull_status: Status,
    status: Status,
    session_error: Option<SyncError>,
    started_replicating: bool,
    had_local_checkpoint: bool,
    remote_checkpoint_requested: bool,
    remote_checkpoint_received: bool,
    remote_checkpoint_rev: String,
    checkpoint_json_to_save: Option<Vec<u8>>,
    autosave_scheduled: bool,
    close_initiated: bool,
    last_delegate_level: Option<ActivityLevel>,
    last_delegate_call: Option<Instant>,
    waiting_to_call_delegate: bool,
    docs_ended: Vec<DocumentEnded>,
    stopped: bool,
}

impl ReplicatorState {
    // ---- lifecycle ----

    fn start_session(&mut self, reset: bool) {
        if self.connection_state != ConnectionState::Closed || self.stopped {
            warn!("start() ignored: session already started");
            return;
        }
        info!(
            push = ?self.options.push,
            pull = ?self.options.pull,
            remote = %self.options.remote_url,
            "starting replication"
        );
        self.connection_state = ConnectionState::Connecting;
        self.connection.start(Arc::new(ConnectionEvents {
            actor: self.self_ref.clone(),
        }));

        self.find_existing_conflicts();

        if self.options.is_active() {
            match self.checkpointer.read_local(&self.db, reset) {
                Ok(found) => {
                    self.had_local_checkpoint = found;
                    if !found
                        && self.options.pull.is_active()
                        && self.db.store().last_sequence() == 0
                    {
                        // Empty db with no checkpoint: deleted revisions
                        // carry no information worth pulling.
                        self.puller.enqueue(|p| p.set_skip_deleted());
                    }
                }
                Err(e) => {
                    error!("could not read local checkpoint: {e}");
                    self.on_error(e.into());
                    self.request_stop();
                    return;
                }
            }
        }
        self.pusher.enqueue(|p| p.announce());
        self.puller.enqueue(|p| p.announce());
        self.changed_status();
    }

    /// Scans for conflicts that predate this session and reports them, so
    /// the application learns about documents needing resolution even if
    /// no new revisions arrive.
    fn find_existing_conflicts(&mut self) {
        if !self.options.pull.is_active() {
            return;
        }
        match self.db.use_store(|store| store.unresolved_conflicts()) {
            Ok(docs) => {
                if !docs.is_empty() {
                    info!(count = docs.len(), "found pre-existing conflicted docs");
                }
                for info in docs {
                    self.document_ended(DocumentEnded {
                        doc_id: info.doc_id,
                        rev_id: info.rev_id.to_string(),
                        direction: Direction::Pull,
                        error: Some(SyncError::conflict("document is in conflict")),
                        error_is_transient: true,
                    });
                }
            }
            Err(e) => {
                warn!("could not enumerate conflicts: {e}");
                self.on_error(e.into());
            }
        }
    }

    fn request_stop(&mut self) {
        self.close_initiated = true;
        self.disconnect(CloseCode::Normal, "");
    }

    fn disconnect(&mut self, code: CloseCode, message: &str) {
        if matches!(
            self.connection_state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.connection.close(code, message);
            self.connection_state = ConnectionState::Closing;
            self.changed_status();
        }
    }

    pub(crate) fn terminate(&mut self) {
        debug!("terminate()");
        self.delegate = None;
        self.stopped = true;
        self.connection.terminate();
        self.pusher.enqueue(|p| p.stop_observing());
        self.pusher.stop();
        self.puller.stop();
        self.revfinder.stop();
        self.inserter.stop();
        self.self_ref.stop();
    }

    // ---- connection events ----

    pub(crate) fn on_connect(&mut self) {
        if self.connection_state == ConnectionState::Closing || self.stopped {
            return;
        }
        info!("connected");
        self.connection_state = ConnectionState::Connected;
        if self.options.is_active() {
            self.request_remote_checkpoint(false);
        }
        self.changed_status();
    }

    pub(crate) fn on_http_response(&mut self, status: u16, headers: Vec<(String, String)>) {
        if status == 101
            && !headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("Sec-WebSocket-Protocol"))
        {
            self.on_error(SyncError::web_socket(
                ws_codes::PROTOCOL_ERROR,
                "Incompatible replication protocol \
                 (missing 'Sec-WebSocket-Protocol' response header)",
            ));
        }
        for (name, value) in &headers {
            if name.eq_ignore_ascii_case("Set-Cookie") {
                let hostname = self.options.remote_hostname().to_string();
                if let Err(e) = self
                    .db
                    .use_store(|store| store.set_cookie(value, &hostname))
                {
                    warn!("could not persist cookie: {e}");
                }
            }
        }
        if let Some(delegate) = &self.delegate {
            delegate.got_http_response(status, &headers);
        }
    }

    pub(crate) fn on_tls_certificate(&mut self, cert: Vec<u8>) {
        if let Some(delegate) = &self.delegate {
            delegate.got_tls_certificate(&cert);
        }
    }

    pub(crate) fn on_close(&mut self, status: CloseStatus, state: ConnectionState) {
        if self.stopped {
            return;
        }
        info!(code = status.code, message = %status.message, "connection closed");
        let closed_by_peer = self.connection_state != ConnectionState::Closing;
        self.connection_state = state;
        self.autosave_scheduled = false;
        self.pusher.enqueue(|p| p.stop_observing());

        let mut status = status;
        if status.is_normal() && closed_by_peer && self.options.is_active() {
            info!("peer initiated the close; treating as going-away");
            status.code = ws_codes::GOING_AWAY;
            status.message = "WebSocket connection closed by peer".to_string();
        }

        if !status.is_normal() {
            let error = SyncError::new(status.reason.domain(), status.code, status.message.clone());
            self.on_error(error);
        }

        self.notify_docs_ended();
        if let Some(delegate) = &self.delegate {
            delegate.connection_closed(&status);
        }
        self.changed_status();
    }

    // ---- incoming requests ----

    pub(crate) fn on_request(&mut self, mut request: IncomingRequest) {
        let profile = request.message.profile().unwrap_or_default().to_string();
        match profile.as_str() {
            profiles::GET_CHECKPOINT => self.handle_get_checkpoint(request),
            profiles::SET_CHECKPOINT => self.handle_set_checkpoint(request),
            profiles::SUB_CHANGES => {
                if self.options.push == ReplMode::Disabled {
                    self.return_forbidden(request);
                } else {
                    self.pusher.enqueue(move |p| p.handle_sub_changes(request));
                }
            }
            profiles::CHANGES | profiles::PROPOSE_CHANGES => {
                if self.options.pull == ReplMode::Disabled {
                    self.return_forbidden(request);
                } else {
                    self.revfinder.enqueue(move |f| f.handle_changes(request));
                }
            }
            profiles::REV => {
                if self.options.pull == ReplMode::Disabled {
                    self.return_forbidden(request);
                } else {
                    self.puller.enqueue(move |p| p.handle_rev(request));
                }
            }
            profiles::NOREV => {
                if self.options.pull == ReplMode::Disabled {
                    self.return_forbidden(request);
                } else {
                    self.puller.enqueue(move |p| p.handle_norev(request));
                }
            }
            profiles::GET_ATTACHMENT | profiles::PROVE_ATTACHMENT => {
                if self.options.push == ReplMode::Disabled {
                    self.return_forbidden(request);
                } else {
                    // Blob transfer is out of scope; bodies are inline.
                    request.not_handled();
                }
            }
            other => {
                warn!(profile = other, "unrecognized request profile");
                request.not_handled();
            }
        }
    }

    fn return_forbidden(&mut self, mut request: IncomingRequest) {
        let message = if self.options.push == ReplMode::Disabled {
            "attempting to pull from a push-disabled replicator"
        } else {
            "attempting to push to a pull-disabled replicator"
        };
        request.respond_error(ErrorResponse::http(403, message));
    }

    fn handle_get_checkpoint(&mut self, mut request: IncomingRequest) {
        let Some(client) = request.message.property("client").map(str::to_string) else {
            request.respond_error(ErrorResponse::blip(400, "missing checkpoint ID"));
            return;
        };
        debug!(client = %client, "peer checkpoint requested");
        match get_peer_checkpoint(&self.db, &client) {
            Ok(Some(doc)) => request.respond(
                Message::response()
                    .with_property("rev", doc.meta)
                    .with_body(doc.body),
            ),
            Ok(None) => request.respond_error(ErrorResponse::http(404, "no such checkpoint")),
            Err(e) => {
                warn!("peer checkpoint lookup failed: {e}");
                request.respond_error(ErrorResponse::http(502, "checkpoint lookup failed"));
            }
        }
    }

    fn handle_set_checkpoint(&mut self, mut request: IncomingRequest) {
        let Some(client) = request.message.property("client").map(str::to_string) else {
            request.respond_error(ErrorResponse::blip(400, "missing checkpoint ID"));
            return;
        };
        let expected = request.message.property("rev").unwrap_or_default().to_string();
        debug!(client = %client, rev = %expected, "peer checkpoint save");
        match save_peer_checkpoint(&self.db, &client, &request.message.body, &expected) {
            Ok(rev) => request.respond(Message::response().with_property("rev", rev)),
            Err(PeerSaveError::Mismatch) => {
                request.respond_error(ErrorResponse::http(409, "revision ID mismatch"));
            }
            Err(PeerSaveError::CorruptStoredRev) => {
                request.respond_error(ErrorResponse::http(500, "corrupt checkpoint revision"));
            }
            Err(PeerSaveError::Store(e)) => {
                warn!("peer checkpoint save failed: {e}");
                request.respond_error(ErrorResponse::http(502, "checkpoint save failed"));
            }
        }
    }

    // ---- checkpoints (active side) ----

    fn request_remote_checkpoint(&mut self, refresh: bool) {
        if self.remote_checkpoint_requested && !refresh {
            return;
        }
        if self.connection_state != ConnectionState::Connected {
            return;
        }
        self.remote_checkpoint_requested = true;
        let client = self.checkpointer.initial_checkpoint_id().to_string();
        debug!(client = %client, "requesting remote checkpoint");
        let message = Message::request(profiles::GET_CHECKPOINT).with_property("client", client);
        let me = self.self_ref.clone();
        self.connection.send_request(
            message,
            Some(Box::new(move |reply| {
                me.enqueue(move |r| r.handle_remote_checkpoint(refresh, reply));
            })),
        );
    }

    fn handle_remote_checkpoint(&mut self, refresh: bool, reply: Result<Message, ReplyError>) {
        let mut remote_body = None;
        match reply {
            Err(ReplyError::Remote(e)) if e.is_http(404) => {
                info!("no remote checkpoint");
                self.remote_checkpoint_rev.clear();
            }
            Err(ReplyError::Remote(e)) => {
                self.on_error(e.into());
                return;
            }
            Err(ReplyError::Disconnected) => return,
            Ok(response) => {
                match CheckpointBody::from_json(&response.body) {
                    Ok(body) => remote_body = Some(body),
                    Err(e) => {
                        self.on_error(SyncError::unexpected(format!(
                            "unreadable remote checkpoint: {e}"
                        )));
                        return;
                    }
                }
                self.remote_checkpoint_rev = response
                    .property("rev")
                    .unwrap_or_default()
                    .to_string();
                info!(rev = %self.remote_checkpoint_rev, "received remote checkpoint");
            }
        }
        self.remote_checkpoint_received = true;

        if !refresh && !self.started_replicating {
            if self.had_local_checkpoint && !self.checkpointer.validate_with(remote_body.as_ref())
            {
                warn!("checkpoint mismatch with peer; re-enumerating from the beginning");
                self.checkpointer.reset();
            }
            self.start_replicating();
        }

        if self.checkpoint_json_to_save.is_some() {
            self.save_checkpoint_now();
        }
    }

    fn start_replicating(&mut self) {
        self.started_replicating = true;
        if self.options.push.is_active() {
            let since = self.checkpointer.local_min_sequence();
            self.pusher.enqueue(move |p| p.start(since));
        }
        if self.options.pull.is_active() {
            let since = self.checkpointer.remote_min_sequence().to_string();
            self.puller.enqueue(move |p| p.start(since));
        }
    }

    pub(crate) fn local_progress(&mut self, sequence: u64) {
        self.checkpointer.update_local(sequence);
        self.schedule_autosave();
    }

    pub(crate) fn remote_progress(&mut self, sequence: RemoteSequence) {
        self.checkpointer.update_remote(sequence.as_str());
        self.schedule_autosave();
    }

    fn schedule_autosave(&mut self) {
        if !self.options.is_active() || self.autosave_scheduled || self.stopped {
            return;
        }
        self.autosave_scheduled = true;
        let delay = self.options.checkpoint_interval;
        self.self_ref.enqueue_after(delay, |r| {
            r.autosave_scheduled = false;
            r.save_checkpoint();
        });
    }

    fn save_checkpoint(&mut self) {
        if !self.options.is_active()
            || self.stopped
            || self.connection_state != ConnectionState::Connected
            || self.checkpoint_json_to_save.is_some()
            || !self.checkpointer.is_unsaved()
        {
            return;
        }
        self.checkpoint_json_to_save = Some(self.checkpointer.begin_save());
        if self.remote_checkpoint_received {
            self.save_checkpoint_now();
        }
        // Otherwise the pending JSON is saved as soon as the remote
        // checkpoint (and its rev) arrives.
    }

    fn save_checkpoint_now(&mut self) {
        let Some(json) = self.checkpoint_json_to_save.clone() else {
            return;
        };
        debug!(rev = %self.remote_checkpoint_rev, "saving remote checkpoint");
        let mut message = Message::request(profiles::SET_CHECKPOINT)
            .with_property("client", self.checkpointer.checkpoint_id())
            .with_body(json);
        if !self.remote_checkpoint_rev.is_empty() {
            message.set_property("rev", self.remote_checkpoint_rev.clone());
        }
        let me = self.self_ref.clone();
        self.connection.send_request(
            message,
            Some(Box::new(move |reply| {
                me.enqueue(move |r| r.handle_checkpoint_saved(reply));
            })),
        );
    }

    fn handle_checkpoint_saved(&mut self, reply: Result<Message, ReplyError>) {
        match reply {
            Err(ReplyError::Remote(e)) if e.is_http(409) => {
                // Our rev token is stale; refetch and retry with the
                // freshest one.
                info!("remote checkpoint rev is stale; refetching");
                self.remote_checkpoint_requested = false;
                self.remote_checkpoint_received = false;
                self.request_remote_checkpoint(true);
            }
            Err(ReplyError::Remote(e)) => {
                warn!("failed to save remote checkpoint: {e}");
                self.checkpoint_json_to_save = None;
                self.checkpointer.save_completed();
                self.on_error(e.into());
                self.changed_status();
            }
            Err(ReplyError::Disconnected) => {
                self.checkpoint_json_to_save = None;
                self.checkpointer.save_completed();
            }
            Ok(response) => {
                self.remote_checkpoint_rev = response
                    .property("rev")
                    .unwrap_or_default()
                    .to_string();
                let json = self.checkpoint_json_to_save.take().unwrap_or_default();
                if let Err(e) =
                    self.checkpointer
                        .write_local(&self.db, &json, &self.remote_checkpoint_rev)
                {
                    self.on_error(e.into());
                } else {
                    info!(rev = %self.remote_checkpoint_rev, "checkpoint saved");
                }
                self.checkpointer.save_completed();
                if self.checkpointer.is_unsaved() {
                    self.schedule_autosave();
                }
                self.changed_status();
            }
        }
    }

    // ---- child coordination ----

    pub(crate) fn child_status(&mut self, child: Child, status: Status) {
        if self.status.level == ActivityLevel::Stopped {
            return;
        }
        match child {
            Child::Pusher if self.options.push != ReplMode::Disabled => {
                self.push_status = status.clone();
            }
            Child::Puller if self.options.pull != ReplMode::Disabled => {
                self.pull_status = status.clone();
            }
            _ => return,
        }
        if let Some(error) = status.error {
            self.on_error(error);
        }
        // Save promptly when a side finishes or goes idle.
        if status.level <= ActivityLevel::Idle {
            self.save_checkpoint();
        }
        self.changed_status();
    }

    pub(crate) fn document_ended(&mut self, ended: DocumentEnded) {
        if self.stopped {
            return;
        }
        debug!(
            doc_id = %ended.doc_id,
            rev_id = %ended.rev_id,
            error = ?ended.error,
            "document ended"
        );
        self.docs_ended.push(ended);
        if self.docs_ended.len() >= DOCS_ENDED_BATCH {
            self.notify_docs_ended();
        }
    }

    pub(crate) fn doc_remote_ancestor_changed(&mut self, doc_id: String, rev_id: String) {
        self.pusher
            .enqueue(move |p| p.doc_remote_ancestor_changed(doc_id, rev_id));
    }

    pub(crate) fn on_error(&mut self, error: SyncError) {
        if self.session_error.is_some()
            && error.domain == crate::error::ErrorDomain::WebSocket
            && (error.code == ws_codes::APP_PERMANENT || error.code == ws_codes::APP_TRANSIENT)
        {
            // The recorded error is more specific than the close code.
            return;
        }
        if self.session_error.is_none() {
            self.session_error = Some(error.clone());
        }
        if let Some((severity, message)) = stopping_severity(&error) {
            error!("stopping due to error: {error}");
            let code = match severity {
                StoppingSeverity::Permanent => CloseCode::AppPermanent,
                StoppingSeverity::Transient => CloseCode::AppTransient,
            };
            self.disconnect(code, message);
            return;
        }
        self.changed_status();
    }

    // ---- status & delegate ----

    fn compute_level(&mut self) -> ActivityLevel {
        if self.status.level == ActivityLevel::Stopped {
            return ActivityLevel::Stopped;
        }
        match self.connection_state {
            ConnectionState::Connecting => ActivityLevel::Connecting,
            ConnectionState::Connected => {
                let mut level = self.push_status.level.max(self.pull_status.level);
                if self.checkpointer.is_unsaved() {
                    level = ActivityLevel::Busy;
                }
                if level == ActivityLevel::Idle
                    && !self.options.is_continuous()
                    && self.options.is_active()
                {
                    if !self.close_initiated {
                        info!("replication complete; closing connection");
                        self.close_initiated = true;
                        self.disconnect(CloseCode::Normal, "");
                    }
                    level = ActivityLevel::Busy;
                }
                level
            }
            ConnectionState::Closing => ActivityLevel::Busy,
            ConnectionState::Closed | ConnectionState::Disconnected => {
                let level = self.push_status.level.max(self.pull_status.level);
                if level < ActivityLevel::Busy {
                    ActivityLevel::Stopped
                } else {
                    level
                }
            }
        }
    }

    fn changed_status(&mut self) {
        let level = self.compute_level();
        let error = self
            .session_error
            .clone()
            .or_else(|| self.push_status.error.clone())
            .or_else(|| self.pull_status.error.clone());
        self.status = Status {
            level,
            progress: self.push_status.progress.plus(self.pull_status.progress),
            error,
            doc_count: self.push_status.doc_count + self.pull_status.doc_count,
        };

        if self.stopped || self.delegate.is_none() {
            return;
        }
        // Throttle: at most one delegate call per interval unless the
        // level changed. Once Stopped is delivered, nothing further.
        let level_changed = self.last_delegate_level != Some(level);
        let elapsed_enough = self
            .last_delegate_call
            .map_or(true, |at| at.elapsed() >= tuning::MIN_DELEGATE_CALL_INTERVAL);
        if level_changed || elapsed_enough {
            self.report_status();
        } else if !self.waiting_to_call_delegate {
            self.waiting_to_call_delegate = true;
            self.self_ref
                .enqueue_after(tuning::MIN_DELEGATE_CALL_INTERVAL, |r| r.report_status());
        }
    }

    fn report_status(&mut self) {
        self.waiting_to_call_delegate = false;
        if self.stopped {
            return;
        }
        self.last_delegate_level = Some(self.status.level);
        self.last_delegate_call = Some(Instant::now());
        self.notify_docs_ended();
        if let Some(delegate) = &self.delegate {
            delegate.status_changed(&self.status);
        }
        if self.status.level == ActivityLevel::Stopped {
            info!("replication stopped");
            self.stopped = true;
            self.delegate = None;
            self.pusher.enqueue(|p| p.stop_observing());
            self.pusher.stop();
            self.puller.stop();
            self.revfinder.stop();
            self.inserter.stop();
        }
    }

    fn notify_docs_ended(&mut self) {
        if self.docs_ended.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.docs_ended);
        if let Some(delegate) = &self.delegate {
            delegate.documents_ended(&batch);
        }
    }

    // ---- introspection ----

    pub(crate) fn pending_document_ids(&mut self) -> Vec<String> {
        let since = self.checkpointer.local_min_sequence();
        let changes = self
            .db
            .use_store(|store| store.changes_since(since, usize::MAX, false))
            .unwrap_or_default();
        let mut ids: Vec<String> = changes
            .into_iter()
            .filter(|change| self.options.passes_doc_filter(&change.doc_id))
            .map(|change| change.doc_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
