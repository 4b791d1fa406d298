//! Serialized access to a document store.

use crate::error::StoreResult;
use crate::store::DocumentStore;
use parking_lot::ReentrantMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);

/// Identifies one logical handle onto a database; observers use it to tell
/// their own commits from external ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleId(pub u32);

/// Serialized access to a [`DocumentStore`].
///
/// All replication work against the store goes through one `DbAccess`: the
/// access lock guarantees that transactions never overlap and that reads see
/// settled state. The lock is reentrant so a handler already holding it may
/// call back into the store.
pub struct DbAccess {
    store: Arc<dyn DocumentStore>,
    lock: Arc<ReentrantMutex<()>>,
    handle: HandleId,
}

impl DbAccess {
    /// Wraps `store` in a new primary handle.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            lock: Arc::new(ReentrantMutex::new(())),
            handle: HandleId(NEXT_HANDLE.fetch_add(1, Ordering::SeqCst)),
        }
    }

    /// This handle's ID, for observer registration.
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// The underlying store, for lock-free metadata reads.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Runs `f` with the serialized-access lock held.
    pub fn use_store<R>(&self, f: impl FnOnce(&dyn DocumentStore) -> R) -> R {
        let _guard = self.lock.lock();
        f(&*self.store)
    }

    /// Runs `body` inside a write transaction, with the access lock held for
    /// the whole transaction.
    pub fn in_transaction(&self, body: &mut dyn FnMut() -> StoreResult<()>) -> StoreResult<()> {
        let _guard = self.lock.lock();
        self.store.in_transaction(self.handle.0, body)
    }

    /// Opens a background handle onto the same database for long-running
    /// scans. The background handle has its own access lock, so its reads do
    /// not block transactions on this handle; commits on either handle reach
    /// the other's observers flagged as external.
    pub fn background(&self) -> BackgroundDb {
        BackgroundDb {
            access: DbAccess {
                store: self.store.clone(),
                lock: Arc::new(ReentrantMutex::new(())),
                handle: HandleId(NEXT_HANDLE.fetch_add(1, Ordering::SeqCst)),
            },
        }
    }
}

/// A second handle onto a database, used for long-running scans
/// (change enumeration, conflict sweeps) so they do not block the primary
/// handle's transactions.
pub struct BackgroundDb {
    access: DbAccess,
}

impl BackgroundDb {
    /// The background handle's serialized accessor.
    pub fn access(&self) -> &DbAccess {
        &self.access
    }
}

static WARNINGS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Returns true when expected-error warnings are currently suppressed.
pub fn warnings_suppressed() -> bool {
    WARNINGS_SUPPRESSED.load(Ordering::Relaxed)
}

/// Suppresses expected-error warnings until the returned guard drops.
///
/// Used by tests that deliberately provoke errors.
pub fn suppress_warnings() -> WarningGuard {
    let previous = WARNINGS_SUPPRESSED.swap(true, Ordering::Relaxed);
    WarningGuard { previous }
}

/// Restores the prior warning state on drop.
pub struct WarningGuard {
    previous: bool,
}

impl Drop for WarningGuard {
    fn drop(&mut self) {
        WARNINGS_SUPPRESSED.store(self.previous, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::revid::RevId;
    use crate::types::{PutRequest, RevFlags};

    #[test]
    fn use_store_is_reentrant() {
        let store = MemoryStore::with_peer_id("a");
        let access = DbAccess::new(store);
        let sequence = access.use_store(|outer| {
            let _ = outer.last_sequence();
            access.use_store(|inner| inner.last_sequence())
        });
        assert_eq!(sequence, 0);
    }

    #[test]
    fn background_handle_is_distinct() {
        let store = MemoryStore::with_peer_id("a");
        let access = DbAccess::new(store);
        let background = access.background();
        assert_ne!(access.handle(), background.access().handle());
    }

    #[test]
    fn background_commits_are_external_to_primary() {
        let store = MemoryStore::with_peer_id("a");
        let access = DbAccess::new(store.clone());
        let background = access.background();

        let tracker = store.tracker();
        let mut observer = Arc::clone(&tracker).observe(0, access.handle().0);

        let request = PutRequest {
            doc_id: "d1".to_string(),
            body: vec![1],
            history: vec![RevId::tree(1, "aa")],
            rev_flags: RevFlags::none().foreign(true),
            allow_conflict: true,
            remote: None,
        };
        background
            .access()
            .in_transaction(&mut || {
                background
                    .access()
                    .store()
                    .insert_existing_revision(&request)
                    .map(|_| ())
            })
            .unwrap();

        let read = observer.read_changes(10);
        assert_eq!(read.changes.len(), 1);
        assert!(read.external);
    }

    #[test]
    fn warning_guard_restores_state() {
        assert!(!warnings_suppressed());
        {
            let _guard = suppress_warnings();
            assert!(warnings_suppressed());
            {
                let _inner = suppress_warnings();
                assert!(warnings_suppressed());
            }
            assert!(warnings_suppressed());
        }
        assert!(!warnings_suppressed());
    }
}
