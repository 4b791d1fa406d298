//! Replicator configuration.

use crate::tuning;
use std::collections::HashSet;
use std::time::Duration;

/// Per-direction replication mode.
///
/// The ordering matters: anything above `Passive` makes that direction
/// active (this side initiates the transfer).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReplMode {
    /// Direction disabled; related requests are refused.
    #[default]
    Disabled,
    /// Serve the peer's requests but initiate nothing.
    Passive,
    /// Replicate once, then stop.
    OneShot,
    /// Keep replicating as the database changes.
    Continuous,
}

impl ReplMode {
    /// True if this mode drives the transfer from this side.
    pub fn is_active(self) -> bool {
        self > ReplMode::Passive
    }
}

/// Configuration for one replication session.
#[derive(Debug, Clone)]
pub struct ReplicatorOptions {
    /// Push direction mode.
    pub push: ReplMode,
    /// Pull direction mode.
    pub pull: ReplMode,
    /// URL of the remote peer (checkpoint identity and cookie scope).
    pub remote_url: String,
    /// Only replicate these document IDs.
    pub doc_ids: Option<HashSet<String>>,
    /// Only replicate these channels.
    pub channels: Vec<String>,
    /// Name of a push filter registered with the store.
    pub filter: Option<String>,
    /// Minimum interval between checkpoint autosaves.
    pub checkpoint_interval: Duration,
    /// Reject peer pushes that would create a conflict.
    pub no_incoming_conflicts: bool,
    /// Never advertise delta support.
    pub disable_delta_support: bool,
    /// Send blobs inline in revision bodies instead of by reference.
    pub disable_blob_support: bool,
    /// Push with `proposeChanges` (conflict-free protocol without
    /// sequences) even when the peer does not demand it.
    pub propose_changes: bool,
}

impl ReplicatorOptions {
    /// Options for a session against `remote_url`, with both directions
    /// disabled.
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self {
            push: ReplMode::Disabled,
            pull: ReplMode::Disabled,
            remote_url: remote_url.into(),
            doc_ids: None,
            channels: Vec::new(),
            filter: None,
            checkpoint_interval: tuning::DEFAULT_CHECKPOINT_SAVE_DELAY,
            no_incoming_conflicts: false,
            disable_delta_support: false,
            disable_blob_support: false,
            propose_changes: false,
        }
    }

    /// A passive server-side session.
    pub fn passive(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url)
            .with_push(ReplMode::Passive)
            .with_pull(ReplMode::Passive)
    }

    /// Sets the push mode.
    pub fn with_push(mut self, mode: ReplMode) -> Self {
        self.push = mode;
        self
    }

    /// Sets the pull mode.
    pub fn with_pull(mut self, mode: ReplMode) -> Self {
        self.pull = mode;
        self
    }

    /// Restricts replication to the given document IDs.
    pub fn with_doc_ids(mut self, doc_ids: impl IntoIterator<Item = String>) -> Self {
        self.doc_ids = Some(doc_ids.into_iter().collect());
        self
    }

    /// Sets the checkpoint autosave interval.
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Rejects peer pushes that would create conflicts.
    pub fn with_no_incoming_conflicts(mut self) -> Self {
        self.no_incoming_conflicts = true;
        self
    }

    /// Pushes via `proposeChanges`.
    pub fn with_propose_changes(mut self) -> Self {
        self.propose_changes = true;
        self
    }

    /// True if either direction is active.
    pub fn is_active(&self) -> bool {
        self.push.is_active() || self.pull.is_active()
    }

    /// True if both directions are at most passive.
    pub fn is_passive_only(&self) -> bool {
        !self.is_active()
    }

    /// True if either direction is continuous.
    pub fn is_continuous(&self) -> bool {
        self.push == ReplMode::Continuous || self.pull == ReplMode::Continuous
    }

    /// True if `doc_id` passes the document-ID filter.
    pub fn passes_doc_filter(&self, doc_id: &str) -> bool {
        match &self.doc_ids {
            Some(ids) => ids.contains(doc_id),
            None => true,
        }
    }

    /// The hostname part of the remote URL, for cookie scoping.
    pub fn remote_hostname(&self) -> &str {
        let rest = self
            .remote_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.remote_url);
        rest.split(['/', ':']).next().unwrap_or(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_activity() {
        assert!(!ReplMode::Disabled.is_active());
        assert!(!ReplMode::Passive.is_active());
        assert!(ReplMode::OneShot.is_active());
        assert!(ReplMode::Continuous.is_active());
    }

    #[test]
    fn builder_and_predicates() {
        let options = ReplicatorOptions::new("ws://peer:4984/db")
            .with_push(ReplMode::Continuous)
            .with_pull(ReplMode::OneShot);
        assert!(options.is_active());
        assert!(options.is_continuous());
        assert!(!options.is_passive_only());

        let passive = ReplicatorOptions::passive("ws://peer/db");
        assert!(passive.is_passive_only());
        assert!(!passive.is_continuous());
    }

    #[test]
    fn doc_filter() {
        let options =
            ReplicatorOptions::new("ws://p/db").with_doc_ids(["d1".to_string(), "d2".to_string()]);
        assert!(options.passes_doc_filter("d1"));
        assert!(!options.passes_doc_filter("d3"));
        assert!(ReplicatorOptions::new("ws://p/db").passes_doc_filter("anything"));
    }

    #[test]
    fn hostname_extraction() {
        assert_eq!(
            ReplicatorOptions::new("wss://peer.example.com:4984/db").remote_hostname(),
            "peer.example.com"
        );
        assert_eq!(
            ReplicatorOptions::new("peer.example.com/db").remote_hostname(),
            "peer.example.com"
        );
    }
}
