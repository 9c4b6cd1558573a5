//! Tagged encoding for binary values.
//!
//! The channel only guarantees plain JSON fidelity, so a byte buffer has to
//! announce itself. A [`Binary`] is written as
//!
//! ```json
//! {"type": "Buffer", "data": [222, 173, 190, 239]}
//! ```
//!
//! and is only reconstructed from a value carrying exactly that tag. Anything
//! else fails to decode instead of silently becoming an inert object.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use keybridge_error::BridgeError;

/// The tag value marking an encoded byte buffer.
pub const BUFFER_TAG: &str = "Buffer";

/// A byte buffer that survives a JSON-only transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Binary(Vec<u8>);

impl Binary {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the raw bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Number of bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Binary {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for Binary {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Serialize)]
struct TaggedRef<'a> {
    #[serde(rename = "type")]
    tag: &'static str,
    data: &'a [u8],
}

#[derive(Deserialize)]
enum BufferTag {
    Buffer,
}

#[derive(Deserialize)]
struct TaggedOwned {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    tag: BufferTag,
    data: Vec<u8>,
}

impl Serialize for Binary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TaggedRef {
            tag: BUFFER_TAG,
            data: &self.0,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Binary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        TaggedOwned::deserialize(deserializer).map(|tagged| Self(tagged.data))
    }
}

/// Encode raw bytes into their tagged JSON form.
pub fn encode(bytes: &[u8]) -> Value {
    serde_json::json!({ "type": BUFFER_TAG, "data": bytes })
}

/// Decode a tagged JSON value back into raw bytes.
pub fn decode(value: &Value) -> Result<Vec<u8>, BridgeError> {
    Binary::deserialize(value)
        .map(Binary::into_vec)
        .map_err(|e| BridgeError::MalformedEnvelope(format!("invalid binary value: {e}")))
}

/// Whether `value` carries the binary tag.
pub fn is_tagged(value: &Value) -> bool {
    value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|tag| tag == BUFFER_TAG)
        && value.get("data").is_some_and(Value::is_array)
}
