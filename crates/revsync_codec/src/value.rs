//! Dynamic document value type.

use crate::error::{CodecError, CodecResult};
use std::cmp::Ordering;

/// A dynamic document value.
///
/// Represents any value a RevSync document body can hold. Map entries keep a
/// canonical ordering so that identical documents encode to identical bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// Floating-point number.
    Float(f64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Text string (UTF-8).
    Text(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Map of key-value pairs, keys sorted canonically.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Creates a map value with canonically sorted keys.
    pub fn map(mut pairs: Vec<(Value, Value)>) -> Self {
        pairs.sort_by(|a, b| a.0.cmp_canonical(&b.0));
        Value::Map(pairs)
    }

    /// Compares two values for canonical ordering.
    ///
    /// Ordering is by type rank first, then by content; strings compare
    /// length-first so that the encoded forms sort bytewise.
    pub fn cmp_canonical(&self, other: &Self) -> Ordering {
        let rank = self.type_rank();
        let other_rank = other.type_rank();
        if rank != other_rank {
            return rank.cmp(&other_rank);
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => match a.len().cmp(&b.len()) {
                Ordering::Equal => a.cmp(b),
                ord => ord,
            },
            (Value::Text(a), Value::Text(b)) => match a.len().cmp(&b.len()) {
                Ordering::Equal => a.cmp(b),
                ord => ord,
            },
            (Value::Array(a), Value::Array(b)) => match a.len().cmp(&b.len()) {
                Ordering::Equal => {
                    for (av, bv) in a.iter().zip(b.iter()) {
                        let ord = av.cmp_canonical(bv);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                }
                ord => ord,
            },
            (Value::Map(a), Value::Map(b)) => match a.len().cmp(&b.len()) {
                Ordering::Equal => {
                    for ((ak, av), (bk, bv)) in a.iter().zip(b.iter()) {
                        let ord = ak.cmp_canonical(bk);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                        let ord = av.cmp_canonical(bv);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                }
                ord => ord,
            },
            _ => Ordering::Equal,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) => 2,
            Value::Float(_) => 3,
            Value::Bytes(_) => 4,
            Value::Text(_) => 5,
            Value::Array(_) => 6,
            Value::Map(_) => 7,
        }
    }

    /// Returns true if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// This value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// This value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// This value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// This value as a string, if it is a text string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// This value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// This value as a map, if it is one.
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Looks up a string key in this map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_text() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Converts a JSON value into a document value.
    ///
    /// JSON numbers become `Integer` when they fit in i64, `Float` otherwise.
    pub fn from_json(json: &serde_json::Value) -> CodecResult<Value> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    return Err(CodecError::unsupported(format!("number {n}")));
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => {
                let converted: CodecResult<Vec<Value>> =
                    items.iter().map(Value::from_json).collect();
                Value::Array(converted?)
            }
            serde_json::Value::Object(entries) => {
                let mut pairs = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    pairs.push((Value::Text(k.clone()), Value::from_json(v)?));
                }
                Value::map(pairs)
            }
        })
    }

    /// Converts this value to JSON.
    ///
    /// Byte strings have no JSON form and are rejected; NaN floats are
    /// rejected as well.
    pub fn to_json(&self) -> CodecResult<serde_json::Value> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| CodecError::unsupported("non-finite float"))?,
            Value::Bytes(_) => {
                return Err(CodecError::unsupported("byte string in JSON"));
            }
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                let converted: CodecResult<Vec<serde_json::Value>> =
                    items.iter().map(Value::to_json).collect();
                serde_json::Value::Array(converted?)
            }
            Value::Map(pairs) => {
                let mut obj = serde_json::Map::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = k
                        .as_text()
                        .ok_or_else(|| CodecError::invalid_structure("non-string map key"))?;
                    obj.insert(key.to_string(), v.to_json()?);
                }
                serde_json::Value::Object(obj)
            }
        })
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_keys_are_sorted() {
        let map = Value::map(vec![
            (Value::from("zz"), Value::from(1)),
            (Value::from("a"), Value::from(2)),
            (Value::from("mm"), Value::from(3)),
        ]);

        if let Value::Map(pairs) = map {
            assert_eq!(pairs[0].0, Value::from("a"));
            assert_eq!(pairs[1].0, Value::from("mm"));
            assert_eq!(pairs[2].0, Value::from("zz"));
        } else {
            panic!("expected Map");
        }
    }

    #[test]
    fn key_ordering_is_length_first() {
        let map = Value::map(vec![
            (Value::from("abc"), Value::from(1)),
            (Value::from("z"), Value::from(2)),
        ]);
        if let Value::Map(pairs) = map {
            assert_eq!(pairs[0].0, Value::from("z"));
        } else {
            panic!("expected Map");
        }
    }

    #[test]
    fn accessors() {
        assert!(Value::Null.is_null());
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Integer(42).as_integer(), Some(42));
        assert_eq!(Value::from("hi").as_text(), Some("hi"));
        assert_eq!(Value::from(vec![1u8, 2]).as_bytes(), Some(&[1u8, 2][..]));
        assert_eq!(Value::Integer(1).as_text(), None);
    }

    #[test]
    fn map_get() {
        let map = Value::map(vec![
            (Value::from("name"), Value::from("alice")),
            (Value::from("age"), Value::from(30)),
        ]);
        assert_eq!(map.get("name"), Some(&Value::from("alice")));
        assert_eq!(map.get("missing"), None);
    }

    #[test]
    fn json_roundtrip() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"k":1,"s":"v","a":[true,null],"f":1.5}"#).unwrap();
        let value = Value::from_json(&json).unwrap();
        let back = value.to_json().unwrap();
        assert_eq!(back, json);
    }

    #[test]
    fn bytes_have_no_json_form() {
        assert!(Value::Bytes(vec![1]).to_json().is_err());
    }
}
