//! Binary document decoder.

use crate::encoder::{
    unzigzag, TAG_ARRAY, TAG_BYTES, TAG_FALSE, TAG_FLOAT, TAG_INT, TAG_MAP, TAG_NULL,
    TAG_SHARED_KEY, TAG_TEXT, TAG_TRUE,
};
use crate::error::{CodecError, CodecResult};
use crate::shared_keys::SharedKeys;
use crate::value::Value;

// Bounds on untrusted input, preventing allocation blowups.
const MAX_CONTAINER_ELEMENTS: u64 = 1 << 24;
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

/// Decoder for the tagged binary document format.
///
/// Shared-key references resolve through the table the body was encoded
/// with; a body containing references decoded without a table (or against
/// the wrong table) fails with [`CodecError::UnknownSharedKey`].
pub struct Decoder<'a> {
    shared_keys: Option<&'a SharedKeys>,
}

impl<'a> Decoder<'a> {
    /// Creates a new decoder resolving keys against `shared_keys`.
    pub fn new(shared_keys: Option<&'a SharedKeys>) -> Self {
        Self { shared_keys }
    }

    /// Decodes a complete value from `bytes`.
    ///
    /// The entire input must be consumed; trailing bytes are an error.
    pub fn decode(&self, bytes: &[u8]) -> CodecResult<Value> {
        let mut cursor = Cursor { data: bytes, pos: 0 };
        let value = self.read_value(&mut cursor)?;
        if cursor.pos < bytes.len() {
            return Err(CodecError::TrailingBytes {
                extra: bytes.len() - cursor.pos,
            });
        }
        Ok(value)
    }

    fn read_value(&self, cursor: &mut Cursor<'_>) -> CodecResult<Value> {
        let offset = cursor.pos;
        let tag = cursor.read_byte()?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_INT => Ok(Value::Integer(unzigzag(cursor.read_varint()?))),
            TAG_FLOAT => {
                let raw = cursor.read_exact(8)?;
                let mut bits = [0u8; 8];
                bits.copy_from_slice(raw);
                Ok(Value::Float(f64::from_bits(u64::from_be_bytes(bits))))
            }
            TAG_BYTES => {
                let len = cursor.read_varint()?;
                if len > MAX_BYTES_LENGTH {
                    return Err(CodecError::invalid_structure("byte string too long"));
                }
                Ok(Value::Bytes(cursor.read_exact(len as usize)?.to_vec()))
            }
            TAG_TEXT => {
                let len = cursor.read_varint()?;
                if len > MAX_BYTES_LENGTH {
                    return Err(CodecError::invalid_structure("text string too long"));
                }
                let raw = cursor.read_exact(len as usize)?;
                let text = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::Text(text.to_string()))
            }
            TAG_ARRAY => {
                let count = cursor.read_varint()?;
                if count > MAX_CONTAINER_ELEMENTS {
                    return Err(CodecError::invalid_structure("array too large"));
                }
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.read_value(cursor)?);
                }
                Ok(Value::Array(items))
            }
            TAG_MAP => {
                let count = cursor.read_varint()?;
                if count > MAX_CONTAINER_ELEMENTS {
                    return Err(CodecError::invalid_structure("map too large"));
                }
                let mut pairs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = self.read_key(cursor)?;
                    let val = self.read_value(cursor)?;
                    pairs.push((key, val));
                }
                Ok(Value::Map(pairs))
            }
            TAG_SHARED_KEY => Err(CodecError::invalid_structure(
                "shared-key reference outside key position",
            )),
            _ => Err(CodecError::InvalidTag { tag, offset }),
        }
    }

    fn read_key(&self, cursor: &mut Cursor<'_>) -> CodecResult<Value> {
        if cursor.peek() == Some(TAG_SHARED_KEY) {
            cursor.read_byte()?;
            let raw = cursor.read_varint()?;
            let id = u16::try_from(raw)
                .map_err(|_| CodecError::invalid_structure("shared-key ID out of range"))?;
            let name = self
                .shared_keys
                .and_then(|keys| keys.decode_key(id))
                .ok_or(CodecError::UnknownSharedKey { id })?;
            return Ok(Value::Text(name));
        }
        self.read_value(cursor)
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = self
            .data
            .get(self.pos)
            .copied()
            .ok_or(CodecError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_exact(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(CodecError::Truncated { offset: self.pos });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_varint(&mut self) -> CodecResult<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_byte()?;
            if shift >= 64 {
                return Err(CodecError::invalid_structure("varint too long"));
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Encoder;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn roundtrip(value: &Value) -> Value {
        let bytes = Encoder::new(None).encode(value).unwrap();
        Decoder::new(None).decode(&bytes).unwrap()
    }

    #[test]
    fn scalar_roundtrips() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Integer(-40),
            Value::Float(2.25),
            Value::Bytes(vec![0, 255, 3]),
            Value::Text("héllo".to_string()),
        ] {
            assert_eq!(roundtrip(&value), value);
        }
    }

    #[test]
    fn nested_roundtrip() {
        let value = Value::map(vec![
            (
                Value::from("items"),
                Value::Array(vec![Value::Integer(1), Value::Null]),
            ),
            (Value::from("ok"), Value::Bool(true)),
        ]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn shared_key_roundtrip() {
        let keys = Arc::new(SharedKeys::new());
        let value = Value::map(vec![
            (Value::from("type"), Value::from("note")),
            (Value::from("count"), Value::from(3)),
        ]);
        let bytes = Encoder::new(Some(keys.clone())).encode(&value).unwrap();
        assert_eq!(Decoder::new(Some(&keys)).decode(&bytes).unwrap(), value);
    }

    #[test]
    fn wrong_table_fails() {
        let keys = Arc::new(SharedKeys::new());
        let value = Value::map(vec![(Value::from("k"), Value::Null)]);
        let bytes = Encoder::new(Some(keys)).encode(&value).unwrap();
        assert!(matches!(
            Decoder::new(None).decode(&bytes),
            Err(CodecError::UnknownSharedKey { id: 0 })
        ));
    }

    #[test]
    fn truncated_input_fails() {
        let bytes = Encoder::new(None)
            .encode(&Value::Text("abcdef".to_string()))
            .unwrap();
        assert!(matches!(
            Decoder::new(None).decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn trailing_bytes_fail() {
        let mut bytes = Encoder::new(None).encode(&Value::Null).unwrap();
        bytes.push(0x00);
        assert!(matches!(
            Decoder::new(None).decode(&bytes),
            Err(CodecError::TrailingBytes { extra: 1 })
        ));
    }

    proptest! {
        #[test]
        fn integers_roundtrip(n in any::<i64>()) {
            prop_assert_eq!(roundtrip(&Value::Integer(n)), Value::Integer(n));
        }

        #[test]
        fn text_roundtrips(s in ".*") {
            let value = Value::Text(s);
            prop_assert_eq!(roundtrip(&value), value);
        }

        #[test]
        fn garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Decoder::new(None).decode(&bytes);
        }
    }
}
