//! Two-peer replication tests over the in-process pipe.
//!
//! Each test wires two full engines (with real in-memory stores) through
//! [`InProcessPipe`] and drives complete sessions: handshake, changes,
//! revision transfer, checkpoints, and shutdown.

use parking_lot::{Condvar, Mutex};
use revsync_engine::pipe::InProcessPipe;
use revsync_engine::{
    ActivityLevel, CloseStatus, DocumentEnded, ReplMode, Replicator, ReplicatorDelegate,
    ReplicatorOptions, Status,
};
use revsync_store::{
    DocumentStore, MemoryStore, MemoryStoreConfig, RevId, PEER_CHECKPOINT_STORE,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Seen {
    statuses: Vec<Status>,
    docs: Vec<DocumentEnded>,
    closes: Vec<CloseStatus>,
}

struct Recording {
    seen: Mutex<Seen>,
    changed: Condvar,
}

impl Recording {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Seen::default()),
            changed: Condvar::new(),
        })
    }

    fn wait_until(&self, mut predicate: impl FnMut(&Seen) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut seen = self.seen.lock();
        while !predicate(&seen) {
            if self.changed.wait_until(&mut seen, deadline).timed_out() {
                return false;
            }
        }
        true
    }

    fn wait_for_level(&self, level: ActivityLevel) {
        assert!(
            self.wait_until(|seen| seen.statuses.iter().any(|s| s.level == level)),
            "timed out waiting for {level:?}"
        );
    }

    fn wait_stopped(&self) {
        self.wait_for_level(ActivityLevel::Stopped);
    }

    fn docs_ended(&self) -> Vec<DocumentEnded> {
        self.seen.lock().docs.clone()
    }

    fn final_error(&self) -> Option<revsync_engine::SyncError> {
        self.seen.lock().statuses.last().and_then(|s| s.error.clone())
    }
}

impl ReplicatorDelegate for Recording {
    fn status_changed(&self, status: &Status) {
        let mut seen = self.seen.lock();
        seen.statuses.push(status.clone());
        self.changed.notify_all();
    }

    fn documents_ended(&self, documents: &[DocumentEnded]) {
        let mut seen = self.seen.lock();
        seen.docs.extend_from_slice(documents);
        self.changed.notify_all();
    }

    fn connection_closed(&self, status: &CloseStatus) {
        let mut seen = self.seen.lock();
        seen.closes.push(status.clone());
        self.changed.notify_all();
    }
}

fn store(name: &str) -> Arc<MemoryStore> {
    MemoryStore::with_peer_id(name)
}

fn vv_store(name: &str) -> Arc<MemoryStore> {
    MemoryStore::new(MemoryStoreConfig {
        peer_id: name.to_string(),
        version_vectors: true,
        ..MemoryStoreConfig::default()
    })
}

fn doc(body: serde_json::Value) -> revsync_codec::Value {
    revsync_codec::Value::from_json(&body).unwrap()
}

/// Reads a document's current body back as JSON.
fn body_of(store: &Arc<MemoryStore>, doc_id: &str) -> Option<serde_json::Value> {
    let info = store.get_document(doc_id).unwrap()?;
    let rev = store.get_revision(doc_id, &info.rev_id).unwrap()?;
    let bytes = rev.body?;
    let keys = store.shared_keys();
    Some(
        revsync_codec::Decoder::new(Some(&keys))
            .decode(&bytes)
            .unwrap()
            .to_json()
            .unwrap(),
    )
}

struct Session {
    active: Arc<Replicator>,
    // Held so the passive session outlives the test body.
    #[allow(dead_code)]
    passive: Arc<Replicator>,
    active_events: Arc<Recording>,
    passive_events: Arc<Recording>,
}

/// Wires `active_store` to `passive_store` and starts both sides.
fn connect(
    active_store: Arc<MemoryStore>,
    passive_store: Arc<MemoryStore>,
    options: ReplicatorOptions,
    reset: bool,
) -> Session {
    let (pipe_a, pipe_b) = InProcessPipe::pair();
    let active_events = Recording::new();
    let passive_events = Recording::new();

    let active = Arc::new(
        Replicator::new(
            active_store,
            pipe_a,
            active_events.clone(),
            options,
        )
        .unwrap(),
    );
    let passive = Arc::new(
        Replicator::new(
            passive_store,
            pipe_b,
            passive_events.clone(),
            ReplicatorOptions::passive("ws://active.peer/db"),
        )
        .unwrap(),
    );

    passive.start(false);
    active.start(reset);
    Session {
        active,
        passive,
        active_events,
        passive_events,
    }
}

/// Runs a one-shot session to completion on both sides.
fn sync_once(
    active_store: &Arc<MemoryStore>,
    passive_store: &Arc<MemoryStore>,
    options: ReplicatorOptions,
) -> Session {
    sync_once_with_reset(active_store, passive_store, options, false)
}

fn sync_once_with_reset(
    active_store: &Arc<MemoryStore>,
    passive_store: &Arc<MemoryStore>,
    options: ReplicatorOptions,
    reset: bool,
) -> Session {
    let session = connect(active_store.clone(), passive_store.clone(), options, reset);
    session.active_events.wait_stopped();
    session.passive_events.wait_stopped();
    session
}

fn push_pull_once() -> ReplicatorOptions {
    ReplicatorOptions::new("ws://passive.peer/db")
        .with_push(ReplMode::OneShot)
        .with_pull(ReplMode::OneShot)
}

// ---- scenarios ----

#[test]
fn empty_to_empty_handshake_reaches_idle() {
    let a = store("a");
    let b = store("b");
    let options = ReplicatorOptions::new("ws://passive.peer/db")
        .with_push(ReplMode::Continuous)
        .with_pull(ReplMode::Continuous);
    let session = connect(a, b, options, false);

    session.active_events.wait_for_level(ActivityLevel::Idle);
    session.passive_events.wait_for_level(ActivityLevel::Idle);
    assert!(session.active_events.docs_ended().is_empty());
    assert!(session.active_events.final_error().is_none());

    session.active.stop();
    session.active_events.wait_stopped();
    session.passive_events.wait_stopped();
}

#[test]
fn single_doc_push() {
    let a = store("a");
    let b = store("b");
    let rev = a
        .put_document("d1", &doc(serde_json::json!({"k": "v"})))
        .unwrap();

    let session = sync_once(
        &a,
        &b,
        ReplicatorOptions::new("ws://passive.peer/db").with_push(ReplMode::OneShot),
    );

    // The body arrived intact, re-encoded with B's shared keys.
    assert_eq!(body_of(&b, "d1").unwrap(), serde_json::json!({"k": "v"}));

    // Same revision ID on both sides; marked foreign on the receiver.
    let info = b.get_document("d1").unwrap().unwrap();
    assert_eq!(info.rev_id, rev);
    let stored = b.get_revision("d1", &rev).unwrap().unwrap();
    assert!(stored.flags.foreign);

    // The pusher reported the document.
    let pushed = session.active_events.docs_ended();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].doc_id, "d1");
    assert!(pushed[0].error.is_none());

    // Nothing left pending once the checkpoint advanced.
    let (tx, rx) = mpsc::channel();
    session
        .active
        .pending_document_ids(Box::new(move |ids| tx.send(ids).unwrap()));
    assert!(rx.recv_timeout(WAIT).unwrap().is_empty());
}

#[test]
fn push_then_pull_converges() {
    let a = store("a");
    let b = store("b");
    a.put_document("from-a", &doc(serde_json::json!({"origin": "a"})))
        .unwrap();
    b.put_document("from-b", &doc(serde_json::json!({"origin": "b"})))
        .unwrap();

    sync_once(&a, &b, push_pull_once());

    for store in [&a, &b] {
        assert_eq!(
            body_of(store, "from-a").unwrap(),
            serde_json::json!({"origin": "a"})
        );
        assert_eq!(
            body_of(store, "from-b").unwrap(),
            serde_json::json!({"origin": "b"})
        );
    }

    // Identical (revID, body) on both sides.
    for doc_id in ["from-a", "from-b"] {
        let rev_a = a.get_document(doc_id).unwrap().unwrap().rev_id;
        let rev_b = b.get_document(doc_id).unwrap().unwrap().rev_id;
        assert_eq!(rev_a, rev_b);
    }
}

#[test]
fn no_op_sync_exchanges_nothing() {
    let a = store("a");
    let b = store("b");
    a.put_document("d1", &doc(serde_json::json!({"n": 1})))
        .unwrap();
    sync_once(&a, &b, push_pull_once());

    let seq_a = a.last_sequence();
    let seq_b = b.last_sequence();

    // Second session with no changes on either side.
    let session = sync_once(&a, &b, push_pull_once());
    assert!(session.active_events.docs_ended().is_empty());
    assert!(session.passive_events.docs_ended().is_empty());
    assert_eq!(a.last_sequence(), seq_a);
    assert_eq!(b.last_sequence(), seq_b);
    assert!(session.active_events.final_error().is_none());
}

#[test]
fn reset_resync_reaches_identical_state() {
    let a = store("a");
    let b = store("b");
    a.put_document("d1", &doc(serde_json::json!({"v": 1})))
        .unwrap();
    a.put_document("d2", &doc(serde_json::json!({"v": 2})))
        .unwrap();
    sync_once(&a, &b, push_pull_once());

    let seq_b = b.last_sequence();
    let session = sync_once_with_reset(&a, &b, push_pull_once(), true);

    // Everything re-enumerated; the peer already had it all, so nothing
    // was re-inserted.
    assert!(session.active_events.final_error().is_none());
    assert_eq!(b.last_sequence(), seq_b);
    for doc_id in ["d1", "d2"] {
        assert_eq!(
            a.get_document(doc_id).unwrap().unwrap().rev_id,
            b.get_document(doc_id).unwrap().unwrap().rev_id
        );
    }
}

#[test]
fn deletion_propagates_as_tombstone() {
    let a = store("a");
    let b = store("b");
    a.put_document("d1", &doc(serde_json::json!({"v": 1})))
        .unwrap();
    sync_once(&a, &b, push_pull_once());

    a.delete_document("d1").unwrap();
    sync_once(&a, &b, push_pull_once());

    let info = b.get_document("d1").unwrap().unwrap();
    assert!(info.flags.deleted);
    assert_eq!(info.rev_id, a.get_document("d1").unwrap().unwrap().rev_id);
}

#[test]
fn proposed_conflict_is_rejected_without_rev_transfer() {
    let a = store("a");
    let b = store("b");
    // Divergent histories for the same document.
    a.put_document("d1", &doc(serde_json::json!({"side": "a"})))
        .unwrap();
    a.put_document("d1", &doc(serde_json::json!({"side": "a2"})))
        .unwrap();
    b.put_document("d1", &doc(serde_json::json!({"side": "b"})))
        .unwrap();
    b.put_document("d1", &doc(serde_json::json!({"side": "b2"})))
        .unwrap();
    let b_rev_before = b.get_document("d1").unwrap().unwrap().rev_id;

    let session = sync_once(
        &a,
        &b,
        ReplicatorOptions::new("ws://passive.peer/db")
            .with_push(ReplMode::OneShot)
            .with_propose_changes(),
    );

    // A learned of the rejection; B's copy is untouched.
    let ended = session.active_events.docs_ended();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].doc_id, "d1");
    assert!(ended[0].error.as_ref().unwrap().is_conflict());
    assert_eq!(b.get_document("d1").unwrap().unwrap().rev_id, b_rev_before);
    assert_eq!(
        body_of(&b, "d1").unwrap(),
        serde_json::json!({"side": "b2"})
    );
}

#[test]
fn proposed_new_document_is_accepted() {
    let a = store("a");
    let b = store("b");
    a.put_document("fresh", &doc(serde_json::json!({"v": 1})))
        .unwrap();

    let session = sync_once(
        &a,
        &b,
        ReplicatorOptions::new("ws://passive.peer/db")
            .with_push(ReplMode::OneShot)
            .with_propose_changes(),
    );

    assert_eq!(body_of(&b, "fresh").unwrap(), serde_json::json!({"v": 1}));
    let ended = session.active_events.docs_ended();
    assert_eq!(ended.len(), 1);
    assert!(ended[0].error.is_none());
}

#[test]
fn conflicting_pull_is_inserted_and_reported() {
    let a = store("a");
    let b = store("b");
    a.put_document("d1", &doc(serde_json::json!({"base": true})))
        .unwrap();
    sync_once(&a, &b, push_pull_once());

    // Both sides edit independently.
    a.put_document("d1", &doc(serde_json::json!({"edit": "a"})))
        .unwrap();
    b.put_document("d1", &doc(serde_json::json!({"edit": "b"})))
        .unwrap();

    // An active puller accepts conflicting revisions (a passive one
    // refuses them); detection is reported, resolution is delegated.
    let session = sync_once(
        &a,
        &b,
        ReplicatorOptions::new("ws://passive.peer/db").with_pull(ReplMode::OneShot),
    );

    assert!(a.get_document("d1").unwrap().unwrap().flags.conflicted);
    let ended = session.active_events.docs_ended();
    assert!(ended
        .iter()
        .any(|d| d.doc_id == "d1"
            && d.error_is_transient
            && d.error.as_ref().is_some_and(|e| e.is_conflict())));

    // B's edit is durably present in A's tree alongside A's.
    let b_rev = b.get_document("d1").unwrap().unwrap().rev_id;
    assert!(a.get_revision("d1", &b_rev).unwrap().unwrap().flags.foreign);
}

#[test]
fn passive_conflict_free_peer_demands_proposals() {
    let a = store("a");
    let b = store("b");
    a.put_document("d1", &doc(serde_json::json!({"v": 1})))
        .unwrap();

    // B only accepts proposeChanges; A sends plain changes.
    let (pipe_a, pipe_b) = InProcessPipe::pair();
    let a_events = Recording::new();
    let b_events = Recording::new();
    let active = Replicator::new(
        a.clone(),
        pipe_a,
        a_events.clone(),
        ReplicatorOptions::new("ws://b/db").with_push(ReplMode::OneShot),
    )
    .unwrap();
    let passive = Replicator::new(
        b.clone(),
        pipe_b,
        b_events.clone(),
        ReplicatorOptions::passive("ws://a/db").with_no_incoming_conflicts(),
    )
    .unwrap();
    passive.start(false);
    active.start(false);
    a_events.wait_stopped();

    // The whole changes message was refused.
    let ended = a_events.docs_ended();
    assert_eq!(ended.len(), 1);
    assert!(ended[0].error.is_some());
    assert!(b.get_document("d1").unwrap().is_none());
    passive.stop();
}

#[test]
fn push_to_pull_only_peer_is_forbidden_and_fatal() {
    let a = store("a");
    let b = store("b");
    a.put_document("d1", &doc(serde_json::json!({"v": 1})))
        .unwrap();

    let (pipe_a, pipe_b) = InProcessPipe::pair();
    let a_events = Recording::new();
    let b_events = Recording::new();
    let active = Replicator::new(
        a.clone(),
        pipe_a,
        a_events.clone(),
        ReplicatorOptions::new("ws://b/db").with_push(ReplMode::OneShot),
    )
    .unwrap();
    // B serves pulls only: its pull direction is disabled.
    let passive = Replicator::new(
        b.clone(),
        pipe_b,
        b_events.clone(),
        ReplicatorOptions::new("ws://a/db").with_push(ReplMode::Passive),
    )
    .unwrap();
    passive.start(false);
    active.start(false);

    a_events.wait_stopped();
    let error = a_events.final_error().expect("expected an error");
    assert_eq!(error.code, 403);
    assert!(b.get_document("d1").unwrap().is_none());
}

#[test]
fn version_vector_peers_converge() {
    let a = vv_store("a");
    let b = vv_store("b");
    a.put_document("d1", &doc(serde_json::json!({"v": 1})))
        .unwrap();

    sync_once(&a, &b, push_pull_once());
    assert_eq!(
        b.get_document("d1").unwrap().unwrap().rev_id.to_string(),
        "1@a"
    );

    // B updates; its vector dominates A's.
    b.put_document("d1", &doc(serde_json::json!({"v": 2})))
        .unwrap();
    sync_once(&a, &b, push_pull_once());

    let rev_a = a.get_document("d1").unwrap().unwrap().rev_id;
    let rev_b = b.get_document("d1").unwrap().unwrap().rev_id;
    assert_eq!(rev_a, rev_b);
    assert_eq!(rev_a.to_string(), "1@b,1@a");
    assert_eq!(body_of(&a, "d1").unwrap(), serde_json::json!({"v": 2}));
}

#[test]
fn version_vector_peers_reject_proposals() {
    // Version-vector databases always use plain changes; a proposing
    // pusher is turned away with a conflict status.
    let a = vv_store("a");
    let b = vv_store("b");
    a.put_document("d1", &doc(serde_json::json!({"v": 1})))
        .unwrap();

    let session = sync_once(
        &a,
        &b,
        ReplicatorOptions::new("ws://passive.peer/db")
            .with_push(ReplMode::OneShot)
            .with_propose_changes(),
    );

    let ended = session.active_events.docs_ended();
    assert_eq!(ended.len(), 1);
    assert!(ended[0].error.is_some());
    assert!(b.get_document("d1").unwrap().is_none());
}

#[test]
fn second_session_announces_known_revs_as_unwanted() {
    // Sync, wipe A's checkpoint via reset, and re-push: B answers every
    // announced rev with "already have", and marks them at the remote.
    let a = store("a");
    let b = store("b");
    a.put_document("d1", &doc(serde_json::json!({"v": 1})))
        .unwrap();
    sync_once(
        &a,
        &b,
        ReplicatorOptions::new("ws://passive.peer/db").with_push(ReplMode::OneShot),
    );

    let session = sync_once_with_reset(
        &a,
        &b,
        ReplicatorOptions::new("ws://passive.peer/db").with_push(ReplMode::OneShot),
        true,
    );
    assert!(session.active_events.final_error().is_none());
    // No new insert happened on B.
    assert_eq!(b.last_sequence(), 1);
}

#[test]
fn continuous_push_delivers_later_changes() {
    let a = store("a");
    let b = store("b");
    let options = ReplicatorOptions::new("ws://passive.peer/db")
        .with_push(ReplMode::Continuous)
        .with_checkpoint_interval(Duration::from_millis(50));
    let session = connect(a.clone(), b.clone(), options, false);
    session.active_events.wait_for_level(ActivityLevel::Idle);

    a.put_document("late", &doc(serde_json::json!({"v": "late"})))
        .unwrap();

    assert!(session
        .passive_events
        .wait_until(|seen| seen.docs.iter().any(|d| d.doc_id == "late")));
    assert_eq!(
        body_of(&b, "late").unwrap(),
        serde_json::json!({"v": "late"})
    );

    session.active.stop();
    session.active_events.wait_stopped();
    session.passive_events.wait_stopped();
}

#[test]
fn checkpoints_are_persisted_on_both_sides() {
    let a = store("a");
    let b = store("b");
    a.put_document("d1", &doc(serde_json::json!({"v": 1})))
        .unwrap();

    sync_once(
        &a,
        &b,
        ReplicatorOptions::new("ws://passive.peer/db")
            .with_push(ReplMode::OneShot)
            .with_checkpoint_interval(Duration::from_millis(20)),
    );

    // B holds A's checkpoint under the client-chosen ID with a 1-cc rev.
    let peer_docs = b.raw_documents(PEER_CHECKPOINT_STORE);
    assert_eq!(peer_docs.len(), 1);
    assert!(peer_docs[0].key.starts_with("cp-"));
    assert_eq!(peer_docs[0].meta, "1-cc");

    // A persisted the matching local checkpoint.
    let local_docs = a.raw_documents(revsync_store::LOCAL_CHECKPOINT_STORE);
    assert_eq!(local_docs.len(), 1);
    assert_eq!(local_docs[0].key, peer_docs[0].key);
    let body: serde_json::Value = serde_json::from_slice(&local_docs[0].body).unwrap();
    assert_eq!(body.get("local").and_then(|v| v.as_u64()), Some(1));

    // A second session with more progress bumps the peer rev token.
    a.put_document("d2", &doc(serde_json::json!({"v": 2})))
        .unwrap();
    sync_once(
        &a,
        &b,
        ReplicatorOptions::new("ws://passive.peer/db")
            .with_push(ReplMode::OneShot)
            .with_checkpoint_interval(Duration::from_millis(20)),
    );
    let peer_docs = b.raw_documents(PEER_CHECKPOINT_STORE);
    assert_eq!(peer_docs.len(), 1);
    assert_eq!(peer_docs[0].meta, "2-cc");
}

#[test]
fn pre_existing_conflicts_are_reported_at_start() {
    use revsync_store::{PutRequest, RemoteId, RevFlags};

    let a = store("a");
    let base = a
        .put_document("d1", &doc(serde_json::json!({"v": 1})))
        .unwrap();
    a.put_document("d1", &doc(serde_json::json!({"v": 2})))
        .unwrap();
    // Inject a conflicting branch, as an earlier replication would have.
    let request = PutRequest {
        doc_id: "d1".to_string(),
        body: Vec::new(),
        history: vec![RevId::tree(2, "feedface00"), base],
        rev_flags: RevFlags::none().foreign(true),
        allow_conflict: true,
        remote: Some(RemoteId(1)),
    };
    a.in_transaction(1, &mut || {
        a.insert_existing_revision(&request).map(|_| ())
    })
    .unwrap();
    assert!(a.get_document("d1").unwrap().unwrap().flags.conflicted);

    let b = store("b");
    let session = connect(
        a.clone(),
        b,
        ReplicatorOptions::new("ws://passive.peer/db").with_pull(ReplMode::Continuous),
        false,
    );

    assert!(session.active_events.wait_until(|seen| {
        seen.docs.iter().any(|d| {
            d.doc_id == "d1"
                && d.error_is_transient
                && d.error.as_ref().is_some_and(|e| e.is_conflict())
        })
    }));

    session.active.stop();
    session.active_events.wait_stopped();
}

#[test]
fn doc_id_filter_limits_push() {
    let a = store("a");
    let b = store("b");
    a.put_document("keep", &doc(serde_json::json!({"v": 1})))
        .unwrap();
    a.put_document("skip", &doc(serde_json::json!({"v": 2})))
        .unwrap();

    sync_once(
        &a,
        &b,
        ReplicatorOptions::new("ws://passive.peer/db")
            .with_push(ReplMode::OneShot)
            .with_doc_ids(["keep".to_string()]),
    );

    assert!(b.get_document("keep").unwrap().is_some());
    assert!(b.get_document("skip").unwrap().is_none());
}

#[test]
fn upgrade_cookies_are_persisted_for_the_remote_host() {
    let a = store("a");
    let b = store("b");
    let (pipe_a, pipe_b) = InProcessPipe::pair();
    pipe_a.set_upgrade_headers(vec![
        (
            "Sec-WebSocket-Protocol".to_string(),
            "revsync+blip".to_string(),
        ),
        ("Set-Cookie".to_string(), "session=abc; Path=/".to_string()),
    ]);

    let a_events = Recording::new();
    let active = Replicator::new(
        a.clone(),
        pipe_a,
        a_events.clone(),
        ReplicatorOptions::new("wss://peer.example.com:4984/db").with_push(ReplMode::OneShot),
    )
    .unwrap();
    let passive = Replicator::new(
        b,
        pipe_b,
        Recording::new(),
        ReplicatorOptions::passive("ws://a/db"),
    )
    .unwrap();
    passive.start(false);
    active.start(false);
    a_events.wait_stopped();

    assert_eq!(
        a.cookies(),
        vec![(
            "peer.example.com".to_string(),
            "session=abc; Path=/".to_string()
        )]
    );
}

#[test]
fn is_document_pending_tracks_push_state() {
    let a = store("a");
    let b = store("b");
    a.put_document("d1", &doc(serde_json::json!({"v": 1})))
        .unwrap();

    let (pipe_a, pipe_b) = InProcessPipe::pair();
    let a_events = Recording::new();
    let active = Arc::new(
        Replicator::new(
            a.clone(),
            pipe_a,
            a_events.clone(),
            ReplicatorOptions::new("ws://b/db").with_push(ReplMode::OneShot),
        )
        .unwrap(),
    );
    let passive = Replicator::new(
        b,
        pipe_b,
        Recording::new(),
        ReplicatorOptions::passive("ws://a/db"),
    )
    .unwrap();

    // Before starting, the doc is pending.
    let (tx, rx) = mpsc::channel();
    active.is_document_pending(
        "d1".to_string(),
        Box::new(move |pending| tx.send(pending).unwrap()),
    );
    assert!(rx.recv_timeout(WAIT).unwrap());

    passive.start(false);
    active.start(false);
    a_events.wait_stopped();

    let (tx, rx) = mpsc::channel();
    active.is_document_pending(
        "d1".to_string(),
        Box::new(move |pending| tx.send(pending).unwrap()),
    );
    assert!(!rx.recv_timeout(WAIT).unwrap());
}
