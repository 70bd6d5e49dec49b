use bytes::Bytes;
use serde_json::{json, Value};

use crate::error::Result;

/// One framed channel message: a two-element JSON array `[id, body]`.
///
/// Messages originating at Vim carry `id >= 1`. Commands we send that
/// expect a reply carry `id <= -1`. An `id` of zero marks a body that
/// does not correlate with anything.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub body: Value,
}

impl Message {
    pub fn new(id: i64, body: Value) -> Self {
        Self { id, body }
    }

    /// Build a message from a decoded JSON value. Two-element arrays whose
    /// first element is an integer split into `{id, body}`; any other
    /// value becomes the body of an uncorrelated message.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(mut parts) if parts.len() == 2 && parts[0].as_i64().is_some() => {
                let body = parts.pop().unwrap_or(Value::Null);
                let id = parts.pop().and_then(|id| id.as_i64()).unwrap_or(0);
                Self { id, body }
            }
            other => Self { id: 0, body: other },
        }
    }

    pub fn encode(&self) -> Value {
        json!([self.id, self.body])
    }

    /// Serialize for the wire, with the trailing line feed the stream
    /// transport uses as its end-of-frame hint.
    pub fn to_wire(&self) -> Result<Bytes> {
        value_to_wire(&self.encode())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Ok(Self::from_value(value))
    }
}

pub(crate) fn value_to_wire(value: &Value) -> Result<Bytes> {
    let mut out = serde_json::to_vec(value)?;
    out.push(b'\n');
    Ok(Bytes::from(out))
}
