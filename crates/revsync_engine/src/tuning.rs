//! Tuning constants for the replication engine.

use std::time::Duration;

/// Delay between the first queued insertion and the batch transaction.
pub const INSERTION_DELAY: Duration = Duration::from_millis(50);

/// Revision bodies at least this large are sent compressed.
pub const MIN_BODY_SIZE_TO_COMPRESS: usize = 500;

/// Default delay between checkpoint progress and the autosave.
pub const DEFAULT_CHECKPOINT_SAVE_DELAY: Duration = Duration::from_secs(5);

/// Minimum interval between delegate status callbacks, unless the activity
/// level changed.
pub const MIN_DELEGATE_CALL_INTERVAL: Duration = Duration::from_millis(200);

/// Number of changes enumerated (and announced) per batch.
pub const CHANGES_BATCH_SIZE: usize = 200;

/// Above this many in-flight requested revisions, incoming `changes`
/// messages are queued instead of handled.
pub const MAX_REVS_IN_FLIGHT: usize = 100;

/// Maximum number of ancestor revisions offered in a `changes` response
/// slot.
pub const MAX_POSSIBLE_ANCESTORS: usize = 20;

/// Fallback revision-history depth when the peer does not announce
/// `maxHistory`.
pub const DEFAULT_MAX_HISTORY: usize = 20;
