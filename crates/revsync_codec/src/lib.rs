//! # RevSync Codec
//!
//! Binary document encoding for RevSync.
//!
//! Document bodies are dicts encoded in a compact tagged binary format.
//! Map keys may be interned through a per-database [`SharedKeys`] table,
//! which is why a body received from a peer must be re-encoded before it
//! is stored locally: the two databases have different key tables.
//!
//! This crate also provides a bridge to and from `serde_json::Value`,
//! since revision bodies travel as JSON on the wire.
//!
//! ## Usage
//!
//! ```
//! use revsync_codec::{Encoder, Decoder, SharedKeys, Value};
//! use std::sync::Arc;
//!
//! let keys = Arc::new(SharedKeys::new());
//! let value = Value::map(vec![(Value::from("name"), Value::from("alice"))]);
//!
//! let bytes = Encoder::new(Some(keys.clone())).encode(&value).unwrap();
//! let decoded = Decoder::new(Some(&keys)).decode(&bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod shared_keys;
mod value;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::{CodecError, CodecResult};
pub use shared_keys::SharedKeys;
pub use value::Value;

/// Encodes a value without a shared-key table.
pub fn to_bytes(value: &Value) -> CodecResult<Vec<u8>> {
    Encoder::new(None).encode(value)
}

/// Decodes a value that was encoded without a shared-key table.
pub fn from_bytes(bytes: &[u8]) -> CodecResult<Value> {
    Decoder::new(None).decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_without_shared_keys() {
        let value = Value::map(vec![
            (Value::from("id"), Value::from(7i64)),
            (Value::from("tags"), Value::from(vec!["a", "b"])),
        ]);
        let bytes = to_bytes(&value).unwrap();
        assert_eq!(from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn shared_keys_shrink_encoding() {
        let keys = std::sync::Arc::new(SharedKeys::new());
        let value = Value::map(vec![(
            Value::from("category"),
            Value::from("x"),
        )]);

        let plain = to_bytes(&value).unwrap();
        let interned = Encoder::new(Some(keys.clone())).encode(&value).unwrap();
        assert!(interned.len() < plain.len());

        let decoded = Decoder::new(Some(&keys)).decode(&interned).unwrap();
        assert_eq!(decoded, value);
    }
}
