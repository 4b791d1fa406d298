//! Ordered change log with observer cursors.

use crate::types::{Change, Sequence};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;

/// Default number of changes delivered per observer wakeup.
pub const OBSERVER_BATCH: usize = 100;

/// Default retention of the sliding log.
const DEFAULT_RETENTION: usize = 10_000;

struct Event {
    change: Change,
    handle: u32,
}

struct Inner {
    events: VecDeque<Event>,
    /// Sequence of the oldest retained event; cursors older than this have
    /// fallen off the window.
    first_retained: Sequence,
    max_retained: usize,
    wakers: Vec<Sender<()>>,
}

/// A sliding ordered log of committed changes.
///
/// The store appends `(sequence, docID, revID)` events at commit; observers
/// hold cursors and drain changes in bounded batches. Retention is bounded:
/// an observer whose cursor is evicted is told so via the `overflow` flag
/// and must refresh from the database.
pub struct SequenceTracker {
    inner: Mutex<Inner>,
}

impl SequenceTracker {
    /// Creates a tracker with default retention.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Creates a tracker retaining at most `max_retained` events.
    pub fn with_retention(max_retained: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                first_retained: 0,
                max_retained,
                wakers: Vec::new(),
            }),
        }
    }

    /// Records a batch of committed changes from `handle` and wakes
    /// observers.
    pub fn record(&self, changes: Vec<Change>, handle: u32) {
        if changes.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for change in changes {
            inner.events.push_back(Event { change, handle });
        }
        while inner.events.len() > inner.max_retained {
            if let Some(evicted) = inner.events.pop_front() {
                inner.first_retained = evicted.change.sequence;
            }
        }
        inner.wakers.retain(|w| w.send(()).is_ok());
    }

    /// Registers an observer positioned after `since`, bound to `handle`.
    ///
    /// Events committed on a different handle are reported with
    /// `external = true`.
    pub fn observe(self: Arc<Self>, since: Sequence, handle: u32) -> ChangeObserver {
        let (tx, rx) = mpsc::channel();
        self.inner.lock().wakers.push(tx);
        ChangeObserver {
            tracker: self,
            cursor: since,
            handle,
            wakeups: rx,
        }
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Changes read by an observer in one batch.
#[derive(Debug, Default)]
pub struct ObservedChanges {
    /// The changes, in sequence order.
    pub changes: Vec<Change>,
    /// True if any change was committed on another handle.
    pub external: bool,
    /// True if the observer's cursor fell off the retained window; the
    /// caller must re-enumerate from the database.
    pub overflow: bool,
}

/// A cursor over a [`SequenceTracker`].
pub struct ChangeObserver {
    tracker: Arc<SequenceTracker>,
    cursor: Sequence,
    handle: u32,
    wakeups: Receiver<()>,
}

impl ChangeObserver {
    /// Reads up to `max` changes past the cursor, advancing it.
    pub fn read_changes(&mut self, max: usize) -> ObservedChanges {
        let inner = self.tracker.inner.lock();
        let mut result = ObservedChanges::default();
        if self.cursor < inner.first_retained {
            result.overflow = true;
            self.cursor = inner.first_retained;
        }
        for event in &inner.events {
            if result.changes.len() >= max {
                break;
            }
            if event.change.sequence > self.cursor {
                if event.handle != self.handle {
                    result.external = true;
                }
                self.cursor = event.change.sequence;
                result.changes.push(event.change.clone());
            }
        }
        result
    }

    /// Blocks until a new event may be available or `timeout` elapses.
    /// Returns true if woken by an event.
    pub fn wait(&self, timeout: std::time::Duration) -> bool {
        // Drain stale wakeups first so one recv corresponds to fresh work.
        loop {
            match self.wakeups.try_recv() {
                Ok(()) => return true,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
        self.wakeups.recv_timeout(timeout).is_ok()
    }

    /// The current cursor position.
    pub fn cursor(&self) -> Sequence {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revid::RevId;

    fn change(sequence: Sequence) -> Change {
        Change {
            sequence,
            doc_id: format!("doc{sequence}"),
            rev_id: RevId::tree(1, "aa"),
            deleted: false,
            body_size: 1,
        }
    }

    #[test]
    fn observer_reads_in_order() {
        let tracker = Arc::new(SequenceTracker::new());
        let mut observer = Arc::clone(&tracker).observe(0, 1);

        tracker.record(vec![change(1), change(2), change(3)], 1);
        let read = observer.read_changes(10);
        assert_eq!(read.changes.len(), 3);
        assert!(!read.external);
        assert!(!read.overflow);
        assert_eq!(read.changes[0].sequence, 1);
        assert_eq!(observer.cursor(), 3);

        // Nothing further.
        assert!(observer.read_changes(10).changes.is_empty());
    }

    #[test]
    fn batches_are_bounded() {
        let tracker = Arc::new(SequenceTracker::new());
        let mut observer = Arc::clone(&tracker).observe(0, 1);
        tracker.record((1..=10).map(change).collect(), 1);

        assert_eq!(observer.read_changes(4).changes.len(), 4);
        assert_eq!(observer.read_changes(100).changes.len(), 6);
    }

    #[test]
    fn external_flag_reports_other_handle() {
        let tracker = Arc::new(SequenceTracker::new());
        let mut observer = Arc::clone(&tracker).observe(0, 1);
        tracker.record(vec![change(1)], 2);

        let read = observer.read_changes(10);
        assert!(read.external);
    }

    #[test]
    fn evicted_cursor_reports_overflow() {
        let tracker = Arc::new(SequenceTracker::with_retention(2));
        let mut observer = Arc::clone(&tracker).observe(0, 1);
        tracker.record((1..=5).map(change).collect(), 1);

        let read = observer.read_changes(10);
        assert!(read.overflow);
        // Only the retained tail is delivered.
        assert_eq!(read.changes.len(), 2);
        assert_eq!(read.changes[0].sequence, 4);
    }

    #[test]
    fn wakeup_on_record() {
        let tracker = Arc::new(SequenceTracker::new());
        let observer = Arc::clone(&tracker).observe(0, 1);
        tracker.record(vec![change(1)], 1);
        assert!(observer.wait(std::time::Duration::from_millis(100)));
    }
}
