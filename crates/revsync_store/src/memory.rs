//! In-memory reference implementation of [`DocumentStore`].

use crate::error::{StoreError, StoreResult};
use crate::revid::{RevId, VectorOrder, VersionVector};
use crate::store::{DocumentStore, RawDocument};
use crate::tracker::SequenceTracker;
use crate::types::{
    AncestorLookup, Change, DocumentFlags, DocumentInfo, ForeignAncestor, InsertOutcome,
    PutRequest, RemoteId, RevFlags, RevisionInfo, Sequence,
};
use parking_lot::Mutex;
use revsync_codec::{Encoder, SharedKeys, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Configuration for a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Peer ID used when authoring version-vector revisions.
    pub peer_id: String,
    /// Identify revisions by version vectors instead of rev-trees.
    pub version_vectors: bool,
    /// Maximum revision-history depth.
    pub max_history_depth: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            peer_id: "local".to_string(),
            version_vectors: false,
            max_history_depth: 20,
        }
    }
}

#[derive(Clone)]
struct RevNode {
    rev_id: RevId,
    parent: Option<usize>,
    flags: RevFlags,
    sequence: Sequence,
    body: Option<Vec<u8>>,
    remotes: HashSet<u32>,
}

#[derive(Clone)]
struct DocRecord {
    nodes: Vec<RevNode>,
    current: usize,
}

impl DocRecord {
    fn find(&self, rev_id: &RevId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.rev_id == rev_id)
    }

    fn is_leaf(&self, index: usize) -> bool {
        !self.nodes.iter().any(|n| n.parent == Some(index))
    }

    fn live_leaf_count(&self) -> usize {
        (0..self.nodes.len())
            .filter(|&i| self.is_leaf(i) && !self.nodes[i].flags.deleted)
            .count()
    }

    fn conflicted(&self) -> bool {
        self.live_leaf_count() > 1
    }

    /// Picks the winning leaf: live beats deleted, then highest generation,
    /// then lexically greatest ID for determinism.
    fn elect_current(&mut self) {
        let mut best: Option<usize> = None;
        for i in 0..self.nodes.len() {
            if !self.is_leaf(i) {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let cand = &self.nodes[i];
                    let cur = &self.nodes[b];
                    (
                        !cand.flags.deleted,
                        cand.rev_id.generation(),
                        cand.rev_id.to_string(),
                    ) > (
                        !cur.flags.deleted,
                        cur.rev_id.generation(),
                        cur.rev_id.to_string(),
                    )
                }
            };
            if better {
                best = Some(i);
            }
        }
        if let Some(b) = best {
            self.current = b;
        }
        let current = self.current;
        for i in 0..self.nodes.len() {
            let losing = self.is_leaf(i) && i != current && !self.nodes[i].flags.deleted;
            self.nodes[i].flags.conflict = losing;
        }
    }

    fn info(&self, doc_id: &str) -> DocumentInfo {
        let node = &self.nodes[self.current];
        DocumentInfo {
            doc_id: doc_id.to_string(),
            rev_id: node.rev_id.clone(),
            flags: DocumentFlags {
                deleted: node.flags.deleted,
                conflicted: self.conflicted(),
            },
            sequence: node.sequence,
            body_size: node.body.as_ref().map(|b| b.len() as u64).unwrap_or(0),
        }
    }
}

#[derive(Clone, Default)]
struct StoreState {
    docs: BTreeMap<String, DocRecord>,
    last_sequence: Sequence,
    raw: HashMap<(String, String), (String, Vec<u8>)>,
}

struct StagedTxn {
    state: StoreState,
    pending: Vec<Change>,
}

struct Inner {
    committed: StoreState,
    staged: Option<StagedTxn>,
    remotes: HashMap<String, u32>,
    next_remote: u32,
    cookies: Vec<(String, String)>,
}

/// An in-memory document store with real rev-trees.
///
/// Backs the engine's test suite and defines the reference semantics of the
/// [`DocumentStore`] trait. Writes are staged per transaction and published
/// atomically on commit, at which point the [`SequenceTracker`] is notified.
pub struct MemoryStore {
    uuid: [u8; 16],
    config: MemoryStoreConfig,
    shared_keys: Arc<SharedKeys>,
    tracker: Arc<SequenceTracker>,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store with the given configuration.
    pub fn new(config: MemoryStoreConfig) -> Arc<Self> {
        let mut hasher = Sha256::new();
        hasher.update(b"revsync-memory-store");
        hasher.update(config.peer_id.as_bytes());
        let digest = hasher.finalize();
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&digest[..16]);

        Arc::new(Self {
            uuid,
            config,
            shared_keys: Arc::new(SharedKeys::new()),
            tracker: Arc::new(SequenceTracker::new()),
            inner: Mutex::new(Inner {
                committed: StoreState::default(),
                staged: None,
                remotes: HashMap::new(),
                next_remote: 1,
                cookies: Vec::new(),
            }),
        })
    }

    /// Creates an empty rev-tree store named `peer_id`.
    pub fn with_peer_id(peer_id: &str) -> Arc<Self> {
        Self::new(MemoryStoreConfig {
            peer_id: peer_id.to_string(),
            ..MemoryStoreConfig::default()
        })
    }

    /// Authors a new revision of `doc_id` with the given body.
    ///
    /// This is the local-write API used by tests; it runs in its own
    /// transaction and notifies observers.
    pub fn put_document(&self, doc_id: &str, body: &Value) -> StoreResult<RevId> {
        self.author_revision(doc_id, Some(body), false)
    }

    /// Authors a deletion (tombstone) revision of `doc_id`.
    pub fn delete_document(&self, doc_id: &str) -> StoreResult<RevId> {
        self.author_revision(doc_id, None, true)
    }

    /// Cookies persisted via `set_cookie`, as `(hostname, header)` pairs.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.inner.lock().cookies.clone()
    }

    /// All raw documents in a named store. Test helper.
    pub fn raw_documents(&self, store: &str) -> Vec<RawDocument> {
        self.with_state(|state| {
            state
                .raw
                .iter()
                .filter(|((name, _), _)| name == store)
                .map(|((_, key), (meta, body))| RawDocument {
                    key: key.clone(),
                    meta: meta.clone(),
                    body: body.clone(),
                })
                .collect()
        })
    }

    fn author_revision(
        &self,
        doc_id: &str,
        body: Option<&Value>,
        deleted: bool,
    ) -> StoreResult<RevId> {
        let encoded = match body {
            Some(value) => Some(
                Encoder::new(Some(self.shared_keys.clone()))
                    .encode(value)
                    .map_err(|e| StoreError::corrupt(e.to_string()))?,
            ),
            None => None,
        };

        let mut inner = self.inner.lock();
        if inner.staged.is_some() {
            return Err(StoreError::transaction_misuse(
                "local write during replication transaction",
            ));
        }
        let state = &mut inner.committed;
        let sequence = state.last_sequence + 1;
        state.last_sequence = sequence;

        let parent_info = state
            .docs
            .get(doc_id)
            .map(|doc| (doc.current, doc.nodes[doc.current].rev_id.clone()));

        let rev_id = if self.config.version_vectors {
            let base = match &parent_info {
                Some((_, RevId::Vector(v))) => v.clone(),
                _ => VersionVector::new(Vec::new()),
            };
            RevId::Vector(base.incremented(&self.config.peer_id))
        } else {
            let generation = parent_info
                .as_ref()
                .map(|(_, rev)| rev.generation() + 1)
                .unwrap_or(1);
            let mut hasher = Sha256::new();
            hasher.update(doc_id.as_bytes());
            hasher.update(generation.to_be_bytes());
            hasher.update([u8::from(deleted)]);
            if let Some(bytes) = &encoded {
                hasher.update(bytes);
            }
            let digest = hasher.finalize();
            let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
            RevId::tree(generation, hex)
        };

        let node = RevNode {
            rev_id: rev_id.clone(),
            parent: parent_info.as_ref().map(|(index, _)| *index),
            flags: RevFlags::none().deleted(deleted),
            sequence,
            body: encoded,
            remotes: HashSet::new(),
        };

        let doc = state.docs.entry(doc_id.to_string()).or_insert(DocRecord {
            nodes: Vec::new(),
            current: 0,
        });
        doc.nodes.push(node);
        doc.elect_current();
        let info = doc.info(doc_id);

        drop(inner);
        self.tracker.record(
            vec![Change {
                sequence,
                doc_id: doc_id.to_string(),
                rev_id: info.rev_id,
                deleted: info.flags.deleted,
                body_size: info.body_size,
            }],
            0,
        );
        Ok(rev_id)
    }

    /// Runs `f` against the staged state if a transaction is active,
    /// otherwise against the committed state.
    fn with_state<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let inner = self.inner.lock();
        match &inner.staged {
            Some(txn) => f(&txn.state),
            None => f(&inner.committed),
        }
    }
}

impl DocumentStore for MemoryStore {
    fn private_uuid(&self) -> [u8; 16] {
        self.uuid
    }

    fn shared_keys(&self) -> Arc<SharedKeys> {
        self.shared_keys.clone()
    }

    fn using_version_vectors(&self) -> bool {
        self.config.version_vectors
    }

    fn max_history_depth(&self) -> usize {
        self.config.max_history_depth
    }

    fn last_sequence(&self) -> Sequence {
        self.with_state(|state| state.last_sequence)
    }

    fn remote_id(&self, url: &str) -> StoreResult<RemoteId> {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.remotes.get(url) {
            return Ok(RemoteId(id));
        }
        let id = inner.next_remote;
        inner.next_remote += 1;
        inner.remotes.insert(url.to_string(), id);
        Ok(RemoteId(id))
    }

    fn tracker(&self) -> Arc<SequenceTracker> {
        self.tracker.clone()
    }

    fn changes_since(
        &self,
        since: Sequence,
        limit: usize,
        skip_deleted: bool,
    ) -> StoreResult<Vec<Change>> {
        Ok(self.with_state(|state| {
            let mut changes: Vec<Change> = state
                .docs
                .iter()
                .filter_map(|(doc_id, doc)| {
                    let info = doc.info(doc_id);
                    if info.sequence <= since {
                        return None;
                    }
                    if skip_deleted && info.flags.deleted {
                        return None;
                    }
                    Some(Change {
                        sequence: info.sequence,
                        doc_id: doc_id.clone(),
                        rev_id: info.rev_id,
                        deleted: info.flags.deleted,
                        body_size: info.body_size,
                    })
                })
                .collect();
            changes.sort_by_key(|c| c.sequence);
            changes.truncate(limit);
            changes
        }))
    }

    fn get_document(&self, doc_id: &str) -> StoreResult<Option<DocumentInfo>> {
        Ok(self.with_state(|state| state.docs.get(doc_id).map(|doc| doc.info(doc_id))))
    }

    fn get_revision(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Option<RevisionInfo>> {
        Ok(self.with_state(|state| {
            state.docs.get(doc_id).and_then(|doc| {
                doc.find(rev_id).map(|index| {
                    let node = &doc.nodes[index];
                    RevisionInfo {
                        rev_id: node.rev_id.clone(),
                        flags: node.flags,
                        sequence: node.sequence,
                        body: node.body.clone(),
                    }
                })
            })
        }))
    }

    fn rev_history(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        max_depth: usize,
        stop_at: &[RevId],
    ) -> StoreResult<Vec<RevId>> {
        self.with_state(|state| {
            let doc = state
                .docs
                .get(doc_id)
                .ok_or_else(|| StoreError::not_found(doc_id))?;
            let start = doc
                .find(rev_id)
                .ok_or_else(|| StoreError::not_found(format!("{doc_id}#{rev_id}")))?;
            let mut history = Vec::new();
            let mut cursor = doc.nodes[start].parent;
            while let Some(index) = cursor {
                if history.len() >= max_depth {
                    break;
                }
                let node = &doc.nodes[index];
                history.push(node.rev_id.clone());
                if stop_at.contains(&node.rev_id) {
                    break;
                }
                cursor = node.parent;
            }
            Ok(history)
        })
    }

    fn find_ancestors(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        remote: RemoteId,
        max_ancestors: usize,
    ) -> StoreResult<AncestorLookup> {
        Ok(self.with_state(|state| {
            let Some(doc) = state.docs.get(doc_id) else {
                // Unknown doc: wanted, no ancestors to offer.
                return AncestorLookup {
                    local_is_older: true,
                    ..AncestorLookup::default()
                };
            };

            if let Some(index) = doc.find(rev_id) {
                return AncestorLookup {
                    local_is_older: false,
                    conflict: false,
                    at_this_remote: doc.nodes[index].remotes.contains(&remote.0),
                    ancestors: Vec::new(),
                };
            }

            let current = &doc.nodes[doc.current];
            let (local_is_older, conflict) = match (rev_id.as_vector(), current.rev_id.as_vector())
            {
                (Some(theirs), Some(mine)) => match theirs.compare(mine) {
                    VectorOrder::Newer => (true, false),
                    VectorOrder::Conflicting => (true, true),
                    VectorOrder::Same | VectorOrder::Older => (false, false),
                },
                _ => {
                    // Rev-trees: an unseen higher generation extends our
                    // branch; an unseen equal-or-lower one diverges from it.
                    if rev_id.generation() > current.rev_id.generation() {
                        (true, false)
                    } else {
                        (true, true)
                    }
                }
            };

            let mut ancestors = Vec::new();
            if local_is_older {
                // Offer the current branch, newest first.
                let mut cursor = Some(doc.current);
                while let Some(index) = cursor {
                    if ancestors.len() >= max_ancestors {
                        break;
                    }
                    let node = &doc.nodes[index];
                    if node.rev_id.generation() < rev_id.generation()
                        || rev_id.as_vector().is_some()
                    {
                        ancestors.push(node.rev_id.clone());
                    }
                    cursor = node.parent;
                }
            }

            AncestorLookup {
                local_is_older,
                conflict,
                at_this_remote: false,
                ancestors,
            }
        }))
    }

    fn foreign_ancestor_of(
        &self,
        doc_id: &str,
        session_start: Sequence,
    ) -> StoreResult<ForeignAncestor> {
        self.with_state(|state| {
            let doc = state
                .docs
                .get(doc_id)
                .ok_or_else(|| StoreError::not_found(doc_id))?;
            let current = &doc.nodes[doc.current];
            if current.flags.foreign {
                return Ok(ForeignAncestor::SkipForeignLeaf);
            }
            let mut cursor = current.parent;
            while let Some(index) = cursor {
                let node = &doc.nodes[index];
                if node.flags.foreign
                    || !node.remotes.is_empty()
                    || (node.sequence > 0 && node.sequence < session_start)
                {
                    return Ok(ForeignAncestor::Ancestor(Some(node.rev_id.clone())));
                }
                cursor = node.parent;
            }
            Ok(ForeignAncestor::Ancestor(None))
        })
    }

    fn unresolved_conflicts(&self) -> StoreResult<Vec<DocumentInfo>> {
        Ok(self.with_state(|state| {
            state
                .docs
                .iter()
                .filter(|(_, doc)| doc.conflicted())
                .map(|(doc_id, doc)| doc.info(doc_id))
                .collect()
        }))
    }

    fn insert_existing_revision(&self, request: &PutRequest) -> StoreResult<InsertOutcome> {
        let mut inner = self.inner.lock();
        let txn = inner.staged.as_mut().ok_or_else(|| {
            StoreError::transaction_misuse("insert_existing_revision outside a transaction")
        })?;
        let state = &mut txn.state;

        let new_rev = request
            .history
            .first()
            .ok_or_else(|| StoreError::invalid_parameter("empty history"))?
            .clone();

        let doc = state
            .docs
            .entry(request.doc_id.clone())
            .or_insert(DocRecord {
                nodes: Vec::new(),
                current: 0,
            });

        if let Some(index) = doc.find(&new_rev) {
            // Already present; just refresh the remote mark.
            if let Some(remote) = request.remote {
                doc.nodes[index].remotes.insert(remote.0);
            }
            return Ok(InsertOutcome {
                sequence: doc.nodes[index].sequence,
                conflicted: doc.conflicted(),
            });
        }

        // Deepest history entry we already have is the attachment point.
        let mut attach: Option<usize> = None;
        let mut missing_from = request.history.len();
        for (offset, rev) in request.history.iter().enumerate().skip(1) {
            if let Some(index) = doc.find(rev) {
                attach = Some(index);
                missing_from = offset;
                break;
            }
        }

        let creates_branch = match attach {
            Some(index) => !doc.is_leaf(index),
            None => !doc.nodes.is_empty(),
        };
        if creates_branch && !request.allow_conflict {
            return Err(StoreError::conflict(&request.doc_id));
        }

        // Insert missing ancestors (bodiless placeholders), oldest first.
        let mut parent = attach;
        for rev in request.history[1..missing_from].iter().rev() {
            doc.nodes.push(RevNode {
                rev_id: rev.clone(),
                parent,
                flags: RevFlags::none().foreign(true),
                sequence: 0,
                body: None,
                remotes: HashSet::new(),
            });
            parent = Some(doc.nodes.len() - 1);
        }

        state.last_sequence += 1;
        let sequence = state.last_sequence;
        let mut remotes = HashSet::new();
        if let Some(remote) = request.remote {
            remotes.insert(remote.0);
        }
        doc.nodes.push(RevNode {
            rev_id: new_rev,
            parent,
            flags: request.rev_flags,
            sequence,
            body: Some(request.body.clone()),
            remotes,
        });
        doc.elect_current();

        let info = doc.info(&request.doc_id);
        let conflicted = info.flags.conflicted;
        txn.pending.push(Change {
            sequence,
            doc_id: request.doc_id.clone(),
            rev_id: info.rev_id,
            deleted: info.flags.deleted,
            body_size: info.body_size,
        });

        Ok(InsertOutcome {
            sequence,
            conflicted,
        })
    }

    fn in_transaction(
        &self,
        handle: u32,
        body: &mut dyn FnMut() -> StoreResult<()>,
    ) -> StoreResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.staged.is_some() {
                return Err(StoreError::transaction_misuse("nested transaction"));
            }
            inner.staged = Some(StagedTxn {
                state: inner.committed.clone(),
                pending: Vec::new(),
            });
        }

        let result = body();

        let mut inner = self.inner.lock();
        let txn = inner
            .staged
            .take()
            .ok_or_else(|| StoreError::unexpected("transaction vanished"))?;
        match result {
            Ok(()) => {
                tracing::debug!(
                    changes = txn.pending.len(),
                    last_sequence = txn.state.last_sequence,
                    "transaction committed"
                );
                inner.committed = txn.state;
                drop(inner);
                self.tracker.record(txn.pending, handle);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn set_remote_ancestor(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        remote: RemoteId,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let state = match &mut inner.staged {
            Some(txn) => &mut txn.state,
            None => &mut inner.committed,
        };
        let doc = state
            .docs
            .get_mut(doc_id)
            .ok_or_else(|| StoreError::not_found(doc_id))?;
        let index = doc
            .find(rev_id)
            .ok_or_else(|| StoreError::not_found(format!("{doc_id}#{rev_id}")))?;
        doc.nodes[index].remotes.insert(remote.0);
        Ok(())
    }

    fn raw_get(&self, store: &str, key: &str) -> StoreResult<Option<RawDocument>> {
        Ok(self.with_state(|state| {
            state
                .raw
                .get(&(store.to_string(), key.to_string()))
                .map(|(meta, body)| RawDocument {
                    key: key.to_string(),
                    meta: meta.clone(),
                    body: body.clone(),
                })
        }))
    }

    fn raw_put(&self, store: &str, key: &str, meta: &str, body: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let state = match &mut inner.staged {
            Some(txn) => &mut txn.state,
            None => &mut inner.committed,
        };
        state.raw.insert(
            (store.to_string(), key.to_string()),
            (meta.to_string(), body.to_vec()),
        );
        Ok(())
    }

    fn set_cookie(&self, set_cookie: &str, hostname: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .cookies
            .push((hostname.to_string(), set_cookie.to_string()));
        Ok(())
    }
}
