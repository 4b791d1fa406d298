//! Binary document encoder.

use crate::error::CodecResult;
use crate::shared_keys::SharedKeys;
use crate::value::Value;
use std::sync::Arc;

// Type tags of the binary format.
pub(crate) const TAG_NULL: u8 = 0x00;
pub(crate) const TAG_FALSE: u8 = 0x01;
pub(crate) const TAG_TRUE: u8 = 0x02;
pub(crate) const TAG_INT: u8 = 0x03;
pub(crate) const TAG_FLOAT: u8 = 0x04;
pub(crate) const TAG_BYTES: u8 = 0x05;
pub(crate) const TAG_TEXT: u8 = 0x06;
pub(crate) const TAG_ARRAY: u8 = 0x07;
pub(crate) const TAG_MAP: u8 = 0x08;
pub(crate) const TAG_SHARED_KEY: u8 = 0x09;

/// Encoder for the tagged binary document format.
///
/// When constructed with a [`SharedKeys`] table, eligible map keys are
/// interned and written as numeric references; the same table must be
/// supplied to the [`Decoder`](crate::Decoder) that reads the output.
pub struct Encoder {
    buffer: Vec<u8>,
    shared_keys: Option<Arc<SharedKeys>>,
}

impl Encoder {
    /// Creates a new encoder, optionally interning keys into `shared_keys`.
    pub fn new(shared_keys: Option<Arc<SharedKeys>>) -> Self {
        Self {
            buffer: Vec::new(),
            shared_keys,
        }
    }

    /// Encodes a value, returning the encoded bytes.
    pub fn encode(mut self, value: &Value) -> CodecResult<Vec<u8>> {
        self.write_value(value)?;
        Ok(self.buffer)
    }

    fn write_value(&mut self, value: &Value) -> CodecResult<()> {
        match value {
            Value::Null => self.buffer.push(TAG_NULL),
            Value::Bool(false) => self.buffer.push(TAG_FALSE),
            Value::Bool(true) => self.buffer.push(TAG_TRUE),
            Value::Integer(n) => {
                self.buffer.push(TAG_INT);
                self.write_varint(zigzag(*n));
            }
            Value::Float(f) => {
                self.buffer.push(TAG_FLOAT);
                self.buffer.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            Value::Bytes(b) => {
                self.buffer.push(TAG_BYTES);
                self.write_varint(b.len() as u64);
                self.buffer.extend_from_slice(b);
            }
            Value::Text(s) => self.write_text(s),
            Value::Array(items) => {
                self.buffer.push(TAG_ARRAY);
                self.write_varint(items.len() as u64);
                for item in items {
                    self.write_value(item)?;
                }
            }
            Value::Map(pairs) => {
                self.buffer.push(TAG_MAP);
                self.write_varint(pairs.len() as u64);
                for (key, val) in pairs {
                    self.write_key(key)?;
                    self.write_value(val)?;
                }
            }
        }
        Ok(())
    }

    fn write_key(&mut self, key: &Value) -> CodecResult<()> {
        if let (Value::Text(s), Some(keys)) = (key, self.shared_keys.as_deref()) {
            if let Some(id) = keys.encode_key(s) {
                self.buffer.push(TAG_SHARED_KEY);
                self.write_varint(u64::from(id));
                return Ok(());
            }
        }
        self.write_value(key)
    }

    fn write_text(&mut self, s: &str) {
        self.buffer.push(TAG_TEXT);
        self.write_varint(s.len() as u64);
        self.buffer.extend_from_slice(s.as_bytes());
    }

    fn write_varint(&mut self, mut n: u64) {
        loop {
            let byte = (n & 0x7f) as u8;
            n >>= 7;
            if n == 0 {
                self.buffer.push(byte);
                return;
            }
            self.buffer.push(byte | 0x80);
        }
    }
}

/// Zigzag-encodes a signed integer so small magnitudes stay small.
pub(crate) fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// Reverses [`zigzag`].
pub(crate) fn unzigzag(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zigzag_roundtrip() {
        for n in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            assert_eq!(unzigzag(zigzag(n)), n);
        }
    }

    #[test]
    fn small_ints_encode_small() {
        let bytes = Encoder::new(None).encode(&Value::Integer(5)).unwrap();
        assert_eq!(bytes, vec![TAG_INT, 10]);
    }

    #[test]
    fn shared_key_reference_is_written() {
        let keys = Arc::new(SharedKeys::new());
        let value = Value::map(vec![(Value::from("id"), Value::Null)]);
        let bytes = Encoder::new(Some(keys)).encode(&value).unwrap();
        // map tag, count 1, shared-key tag, id 0, null
        assert_eq!(bytes, vec![TAG_MAP, 1, TAG_SHARED_KEY, 0, TAG_NULL]);
    }

    #[test]
    fn ineligible_key_is_written_literally() {
        let keys = Arc::new(SharedKeys::new());
        let value = Value::map(vec![(Value::from("not a key!"), Value::Null)]);
        let bytes = Encoder::new(Some(keys.clone())).encode(&value).unwrap();
        assert_eq!(bytes[2], TAG_TEXT);
        assert!(keys.is_empty());
    }
}
