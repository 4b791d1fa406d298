//! Per-database shared-key table.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Maximum number of keys a table will intern.
const MAX_KEYS: usize = 2048;

/// Maximum byte length of an internable key.
const MAX_KEY_LEN: usize = 16;

/// A per-database string-interning table for map keys.
///
/// Frequently used dict keys are assigned small integer IDs so that encoded
/// bodies reference them by number instead of repeating the string. The
/// table is append-only: IDs are never reused or removed, so any body
/// encoded against a table remains decodable against every later state of
/// the same table.
///
/// Two databases have *independent* tables; a body encoded with one
/// database's keys is meaningless to another, which is why replicated
/// revisions are re-encoded on insertion.
pub struct SharedKeys {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, u16>,
    names: Vec<String>,
}

impl SharedKeys {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Returns true if `key` is eligible for interning.
    ///
    /// Only short identifier-like keys are interned; anything else is
    /// written as a literal string.
    pub fn is_eligible(key: &str) -> bool {
        !key.is_empty()
            && key.len() <= MAX_KEY_LEN
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }

    /// Interns `key` if eligible, returning its ID.
    ///
    /// Returns `None` when the key is not eligible or the table is full.
    pub fn encode_key(&self, key: &str) -> Option<u16> {
        if !Self::is_eligible(key) {
            return None;
        }
        if let Some(&id) = self.inner.read().by_name.get(key) {
            return Some(id);
        }
        let mut inner = self.inner.write();
        // Re-check under the write lock.
        if let Some(&id) = inner.by_name.get(key) {
            return Some(id);
        }
        if inner.names.len() >= MAX_KEYS {
            return None;
        }
        let id = inner.names.len() as u16;
        inner.names.push(key.to_string());
        inner.by_name.insert(key.to_string(), id);
        Some(id)
    }

    /// Resolves an ID back to its key string.
    pub fn decode_key(&self, id: u16) -> Option<String> {
        self.inner.read().names.get(id as usize).cloned()
    }

    /// Number of interned keys.
    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    /// Returns true if no keys are interned.
    pub fn is_empty(&self) -> bool {
        self.inner.read().names.is_empty()
    }
}

impl Default for SharedKeys {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interns_and_resolves() {
        let keys = SharedKeys::new();
        let id = keys.encode_key("name").unwrap();
        assert_eq!(keys.encode_key("name"), Some(id));
        assert_eq!(keys.decode_key(id).as_deref(), Some("name"));
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn ids_are_sequential() {
        let keys = SharedKeys::new();
        assert_eq!(keys.encode_key("a"), Some(0));
        assert_eq!(keys.encode_key("b"), Some(1));
        assert_eq!(keys.encode_key("a"), Some(0));
    }

    #[test]
    fn ineligible_keys_are_rejected() {
        let keys = SharedKeys::new();
        assert_eq!(keys.encode_key(""), None);
        assert_eq!(keys.encode_key("has space"), None);
        assert_eq!(keys.encode_key("averyveryverylongkeyname"), None);
        assert!(keys.is_empty());
    }

    #[test]
    fn unknown_id_does_not_resolve() {
        let keys = SharedKeys::new();
        assert_eq!(keys.decode_key(9), None);
    }

    #[test]
    fn independent_tables_disagree() {
        let a = SharedKeys::new();
        let b = SharedKeys::new();
        a.encode_key("first");
        b.encode_key("other");
        assert_eq!(a.decode_key(0).as_deref(), Some("first"));
        assert_eq!(b.decode_key(0).as_deref(), Some("other"));
    }
}
