//! Revision identifiers: tree form and version vectors.

use crate::error::{StoreError, StoreResult};
use std::cmp::Ordering;
use std::fmt;

/// A revision identifier.
///
/// Two schemes coexist, selected per database:
///
/// - **Tree form** `"{generation}-{digest}"`: ancestry is explicit via
///   parent links; the generation is a positive integer and advances by one
///   per revision along a branch.
/// - **Version vector** `"counter@peer[,counter@peer…]"`: a per-peer counter
///   map; ancestry is implied by vector comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RevId {
    /// Tree-style revision ID.
    Tree {
        /// Generation number (≥ 1).
        generation: u64,
        /// Digest suffix.
        digest: String,
    },
    /// Version-vector revision ID.
    Vector(VersionVector),
}

impl RevId {
    /// Parses a revision ID from its ASCII form.
    ///
    /// A string containing `@` is parsed as a version vector; one containing
    /// `-` as a tree ID. Anything else is invalid.
    pub fn parse(s: &str) -> StoreResult<RevId> {
        if s.contains('@') {
            return Ok(RevId::Vector(VersionVector::parse(s)?));
        }
        let (gen_str, digest) = s
            .split_once('-')
            .ok_or_else(|| StoreError::corrupt(format!("invalid revision ID '{s}'")))?;
        let generation: u64 = gen_str
            .parse()
            .map_err(|_| StoreError::corrupt(format!("invalid generation in '{s}'")))?;
        if generation == 0 || digest.is_empty() {
            return Err(StoreError::corrupt(format!("invalid revision ID '{s}'")));
        }
        Ok(RevId::Tree {
            generation,
            digest: digest.to_string(),
        })
    }

    /// Builds a tree-form revision ID.
    pub fn tree(generation: u64, digest: impl Into<String>) -> RevId {
        RevId::Tree {
            generation,
            digest: digest.into(),
        }
    }

    /// The generation number, for tree IDs; 0 for vectors.
    pub fn generation(&self) -> u64 {
        match self {
            RevId::Tree { generation, .. } => *generation,
            RevId::Vector(_) => 0,
        }
    }

    /// The version vector, if this is a vector ID.
    pub fn as_vector(&self) -> Option<&VersionVector> {
        match self {
            RevId::Vector(v) => Some(v),
            RevId::Tree { .. } => None,
        }
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevId::Tree { generation, digest } => write!(f, "{generation}-{digest}"),
            RevId::Vector(v) => v.fmt(f),
        }
    }
}

/// Outcome of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrder {
    /// The vectors are identical.
    Same,
    /// Self is older than (an ancestor of) the other.
    Older,
    /// Self is newer than (a descendant of) the other.
    Newer,
    /// Neither descends from the other.
    Conflicting,
}

/// A version vector: an ordered list of `counter@peer` entries, newest first.
///
/// The wire requires the absolute form: the `*` placeholder for "this peer"
/// is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionVector {
    entries: Vec<(u64, String)>,
}

impl VersionVector {
    /// Parses the ASCII form `counter@peer[,counter@peer…]`.
    pub fn parse(s: &str) -> StoreResult<VersionVector> {
        if s.is_empty() {
            return Err(StoreError::corrupt("empty version vector"));
        }
        let mut entries = Vec::new();
        for part in s.split(',') {
            let (counter_str, peer) = part
                .split_once('@')
                .ok_or_else(|| StoreError::corrupt(format!("invalid vector entry '{part}'")))?;
            if peer.is_empty() || peer.contains('*') {
                return Err(StoreError::corrupt(format!(
                    "version vector requires absolute peer IDs, got '{part}'"
                )));
            }
            let counter: u64 = counter_str
                .parse()
                .map_err(|_| StoreError::corrupt(format!("invalid counter in '{part}'")))?;
            if counter == 0 {
                return Err(StoreError::corrupt(format!("zero counter in '{part}'")));
            }
            if entries.iter().any(|(_, p): &(u64, String)| p == peer) {
                return Err(StoreError::corrupt(format!("duplicate peer '{peer}'")));
            }
            entries.push((counter, peer.to_string()));
        }
        Ok(VersionVector { entries })
    }

    /// Builds a vector from `(counter, peer)` entries, newest first.
    pub fn new(entries: Vec<(u64, String)>) -> VersionVector {
        VersionVector { entries }
    }

    /// The counter recorded for `peer`, or 0 if absent.
    pub fn counter_for(&self, peer: &str) -> u64 {
        self.entries
            .iter()
            .find(|(_, p)| p == peer)
            .map(|(c, _)| *c)
            .unwrap_or(0)
    }

    /// Returns a copy with `peer`'s counter bumped past both inputs and
    /// moved to the front.
    pub fn incremented(&self, peer: &str) -> VersionVector {
        let next = self.counter_for(peer) + 1;
        let mut entries = vec![(next, peer.to_string())];
        entries.extend(
            self.entries
                .iter()
                .filter(|(_, p)| p != peer)
                .cloned(),
        );
        VersionVector { entries }
    }

    /// Compares this vector against another.
    pub fn compare(&self, other: &VersionVector) -> VectorOrder {
        let mut some_greater = false;
        let mut some_less = false;
        for (counter, peer) in &self.entries {
            match counter.cmp(&other.counter_for(peer)) {
                Ordering::Greater => some_greater = true,
                Ordering::Less => some_less = true,
                Ordering::Equal => {}
            }
        }
        for (counter, peer) in &other.entries {
            match self.counter_for(peer).cmp(counter) {
                Ordering::Greater => some_greater = true,
                Ordering::Less => some_less = true,
                Ordering::Equal => {}
            }
        }
        match (some_greater, some_less) {
            (false, false) => VectorOrder::Same,
            (true, false) => VectorOrder::Newer,
            (false, true) => VectorOrder::Older,
            (true, true) => VectorOrder::Conflicting,
        }
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (counter, peer)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{counter}@{peer}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_tree_id() {
        let rev = RevId::parse("3-deadbeef").unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.to_string(), "3-deadbeef");
    }

    #[test]
    fn reject_bad_tree_ids() {
        assert!(RevId::parse("0-abc").is_err());
        assert!(RevId::parse("-abc").is_err());
        assert!(RevId::parse("3-").is_err());
        assert!(RevId::parse("nodash").is_err());
        assert!(RevId::parse("x-abc").is_err());
    }

    #[test]
    fn parse_vector_id() {
        let rev = RevId::parse("7@alice,3@bob").unwrap();
        let vector = rev.as_vector().unwrap();
        assert_eq!(vector.counter_for("alice"), 7);
        assert_eq!(vector.counter_for("bob"), 3);
        assert_eq!(vector.counter_for("carol"), 0);
        assert_eq!(rev.to_string(), "7@alice,3@bob");
    }

    #[test]
    fn reject_relative_vectors() {
        assert!(VersionVector::parse("7@*").is_err());
        assert!(VersionVector::parse("7@").is_err());
        assert!(VersionVector::parse("0@alice").is_err());
        assert!(VersionVector::parse("7@alice,1@alice").is_err());
    }

    #[test]
    fn vector_comparison() {
        let a = VersionVector::parse("2@x,1@y").unwrap();
        let same = VersionVector::parse("1@y,2@x").unwrap();
        let older = VersionVector::parse("1@x,1@y").unwrap();
        let conflicting = VersionVector::parse("1@x,2@y").unwrap();

        assert_eq!(a.compare(&same), VectorOrder::Same);
        assert_eq!(older.compare(&a), VectorOrder::Older);
        assert_eq!(a.compare(&older), VectorOrder::Newer);
        assert_eq!(a.compare(&conflicting), VectorOrder::Conflicting);
    }

    #[test]
    fn increment_moves_peer_to_front() {
        let a = VersionVector::parse("2@x,5@y").unwrap();
        let bumped = a.incremented("y");
        assert_eq!(bumped.to_string(), "6@y,2@x");
        assert_eq!(bumped.compare(&a), VectorOrder::Newer);
    }

    #[test]
    fn increment_unknown_peer() {
        let a = VersionVector::parse("2@x").unwrap();
        assert_eq!(a.incremented("z").to_string(), "1@z,2@x");
    }

    proptest! {
        #[test]
        fn tree_ids_roundtrip(generation in 1u64..u64::MAX, digest in "[0-9a-f]{4,16}") {
            let rev = RevId::tree(generation, digest);
            let parsed = RevId::parse(&rev.to_string()).unwrap();
            prop_assert_eq!(parsed, rev);
        }

        #[test]
        fn vector_ids_roundtrip(counters in proptest::collection::vec(1u64..1000, 1..4)) {
            let entries: Vec<(u64, String)> = counters
                .iter()
                .enumerate()
                .map(|(i, c)| (*c, format!("p{i}")))
                .collect();
            let vector = VersionVector::new(entries);
            let parsed = VersionVector::parse(&vector.to_string()).unwrap();
            prop_assert_eq!(parsed.compare(&vector), VectorOrder::Same);
        }
    }
}
