//! Reply values handed back to callers.

use crate::error::ServerError;
use crate::frame::Frame;
use bytes::Bytes;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::HashMap;

/// A successful reply.
///
/// RESP3-only frame types are folded into the nearest variant: booleans
/// become `Int(1)`/`Int(0)`, sets become arrays, verbatim strings become
/// bulk strings and big numbers keep their decimal text as a status.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Double(f64),
    Status(String),
    Bulk(Bytes),
    Array(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns the value as text when it is a status or UTF-8 bulk string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Status(s) => Some(s),
            Value::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Status(s) => Some(s.as_bytes()),
            Value::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as an integer, parsing textual replies.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Status(_) | Value::Bulk(_) => self.as_str()?.parse().ok(),
            _ => None,
        }
    }

    /// Returns the value as a float, parsing textual replies.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(*i as f64),
            Value::Status(_) | Value::Bulk(_) => self.as_str()?.parse().ok(),
            _ => None,
        }
    }

    /// Returns whether the value is the conventional `OK` status.
    pub fn is_ok(&self) -> bool {
        matches!(self, Value::Status(s) if s == "OK")
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Value::Bulk(b) => Some(b),
            Value::Status(s) => Some(Bytes::from(s)),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Value::Status(s) => Some(s),
            Value::Bulk(b) => String::from_utf8(b.to_vec()).ok(),
            _ => None,
        }
    }

    /// Looks up a key in a map reply.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_none(),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Double(d) => serializer.serialize_f64(*d),
            Value::Status(s) => serializer.serialize_str(s),
            Value::Bulk(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl Frame {
    /// Converts a reply frame into a value, surfacing error frames as
    /// [`ServerError`]. An error nested anywhere inside an aggregate turns
    /// the whole reply into that error.
    pub fn into_value(self) -> Result<Value, ServerError> {
        Ok(match self {
            Frame::Error(line) => return Err(ServerError::parse(line)),
            Frame::Null => Value::Nil,
            Frame::Simple(s) => Value::Status(s),
            Frame::Integer(i) => Value::Int(i),
            Frame::Double(d) => Value::Double(d),
            Frame::Boolean(b) => Value::Int(b as i64),
            Frame::BigNumber(n) => Value::Status(n),
            Frame::Bulk(b) => Value::Bulk(b),
            Frame::Verbatim { text, .. } => Value::Bulk(text),
            Frame::Array(items) | Frame::Set(items) | Frame::Push(items) => Value::Array(
                items
                    .into_iter()
                    .map(Frame::into_value)
                    .collect::<Result<_, _>>()?,
            ),
            Frame::Map(pairs) => {
                let mut map = HashMap::with_capacity(pairs.len());
                for (key, value) in pairs {
                    map.insert(key_text(key)?, value.into_value()?);
                }
                Value::Map(map)
            }
        })
    }
}

/// Renders a map key as text.
fn key_text(key: Frame) -> Result<String, ServerError> {
    Ok(match key.into_value()? {
        Value::Nil => String::new(),
        Value::Int(i) => i.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Status(s) => s,
        Value::Bulk(b) => String::from_utf8_lossy(&b).into_owned(),
        other => format!("{:?}", other),
    })
}
