//! Activity levels, progress, and aggregated replicator status.

use crate::error::SyncError;

/// How busy one actor (or the whole replicator) is.
///
/// The ordering matters: an aggregate takes the maximum of its parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActivityLevel {
    /// Finished (or never started).
    #[default]
    Stopped,
    /// Temporarily unable to reach the peer.
    Offline,
    /// Connection being established.
    Connecting,
    /// Connected, nothing to do.
    Idle,
    /// Actively transferring.
    Busy,
}

impl ActivityLevel {
    /// Short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            ActivityLevel::Stopped => "stopped",
            ActivityLevel::Offline => "offline",
            ActivityLevel::Connecting => "connecting",
            ActivityLevel::Idle => "idle",
            ActivityLevel::Busy => "busy",
        }
    }
}

/// Transfer progress in abstract units (body bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Units completed so far.
    pub units_completed: u64,
    /// Units known about so far.
    pub units_total: u64,
}

impl Progress {
    /// Sums two progress counters.
    pub fn plus(self, other: Progress) -> Progress {
        Progress {
            units_completed: self.units_completed + other.units_completed,
            units_total: self.units_total + other.units_total,
        }
    }
}

/// Status of one actor or of the replicator as a whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    /// Activity level.
    pub level: ActivityLevel,
    /// Transfer progress.
    pub progress: Progress,
    /// First error encountered, if any.
    pub error: Option<SyncError>,
    /// Number of documents that have finished replicating.
    pub doc_count: u64,
}

impl Status {
    /// A status at the given level with no progress or error.
    pub fn at(level: ActivityLevel) -> Status {
        Status {
            level,
            ..Status::default()
        }
    }

    /// Aggregates child statuses: maximum level, summed progress, first
    /// error, summed doc count.
    pub fn aggregate(children: &[&Status]) -> Status {
        let mut result = Status::default();
        for child in children {
            result.level = result.level.max(child.level);
            result.progress = result.progress.plus(child.progress);
            if result.error.is_none() {
                result.error = child.error.clone();
            }
            result.doc_count += child.doc_count;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(ActivityLevel::Busy > ActivityLevel::Idle);
        assert!(ActivityLevel::Idle > ActivityLevel::Connecting);
        assert!(ActivityLevel::Connecting > ActivityLevel::Offline);
        assert!(ActivityLevel::Offline > ActivityLevel::Stopped);
    }

    #[test]
    fn aggregation_takes_max_level_and_sums() {
        let push = Status {
            level: ActivityLevel::Idle,
            progress: Progress {
                units_completed: 5,
                units_total: 10,
            },
            error: None,
            doc_count: 1,
        };
        let pull = Status {
            level: ActivityLevel::Busy,
            progress: Progress {
                units_completed: 1,
                units_total: 2,
            },
            error: Some(SyncError::http(503, "busy")),
            doc_count: 2,
        };

        let total = Status::aggregate(&[&push, &pull]);
        assert_eq!(total.level, ActivityLevel::Busy);
        assert_eq!(total.progress.units_completed, 6);
        assert_eq!(total.progress.units_total, 12);
        assert_eq!(total.doc_count, 3);
        assert_eq!(total.error, Some(SyncError::http(503, "busy")));
    }

    #[test]
    fn first_error_wins() {
        let a = Status {
            error: Some(SyncError::http(403, "a")),
            ..Status::default()
        };
        let b = Status {
            error: Some(SyncError::http(503, "b")),
            ..Status::default()
        };
        let total = Status::aggregate(&[&a, &b]);
        assert_eq!(total.error.unwrap().code, 403);
    }
}
