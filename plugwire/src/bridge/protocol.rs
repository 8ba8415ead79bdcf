//! Wire types exchanged between master and plugin.
//!
//! Every frame is a [`Message`]: either a call request or the response to one.
//! Arguments and results travel as [`Value`]s, type-tagged payloads that only
//! mean something relative to the receiver's type registry.

use serde::{Deserialize, Serialize};

/// A type-tagged, codec-encoded argument or result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl Value {
    pub fn new(type_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            type_name: type_name.into(),
            payload,
        }
    }
}

/// One frame on the wire.
///
/// `id` is assigned by the side that initiated the call and echoed unchanged
/// by the response. `func_id` on a response is only a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub is_response: bool,
    pub func_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
    /// Set on responses whose invocation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    pub fn request(id: u64, func_id: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            id,
            is_response: false,
            func_id: func_id.into(),
            values,
            error: None,
        }
    }

    pub fn response(id: u64, func_id: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            id,
            is_response: true,
            func_id: func_id.into(),
            values,
            error: None,
        }
    }

    pub fn failure(id: u64, func_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            is_response: true,
            func_id: func_id.into(),
            values: Vec::new(),
            error: Some(error.into()),
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
