//! Internal bus envelope wrapping raw device payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message class carried by an envelope, derived from the MQTT topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Telemetry,
    Shadow,
    Command,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Telemetry => "telemetry",
            MsgType::Shadow => "shadow",
            MsgType::Command => "command",
        }
    }

    /// Parse the trailing topic segment into a message type.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telemetry" => Some(MsgType::Telemetry),
            "shadow" => Some(MsgType::Shadow),
            "command" => Some(MsgType::Command),
            _ => None,
        }
    }
}

/// Raw payload carried by an envelope.
///
/// Devices publish JSON objects; binary firmware blobs are carried
/// base64-encoded so the envelope itself stays canonical JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadBody {
    Object(serde_json::Map<String, serde_json::Value>),
    Binary(String),
}

impl PayloadBody {
    /// Decode a binary payload. Returns `None` for object payloads or
    /// invalid base64.
    pub fn decode_binary(&self) -> Option<Vec<u8>> {
        use base64::Engine;
        match self {
            PayloadBody::Binary(b64) => {
                base64::engine::general_purpose::STANDARD.decode(b64).ok()
            }
            PayloadBody::Object(_) => None,
        }
    }

    /// Approximate serialized size in bytes, used for admission limits.
    pub fn approx_len(&self) -> usize {
        match self {
            PayloadBody::Object(map) => serde_json::to_vec(map).map(|v| v.len()).unwrap_or(0),
            PayloadBody::Binary(b64) => b64.len(),
        }
    }
}

/// Bus message wrapping one device publish with routing metadata.
///
/// Serialized as canonical JSON on every stream; `received_at` is stamped
/// by the bridge (or the HTTP ingest endpoint) in UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub tenant: String,
    pub device: String,
    pub msg_type: MsgType,
    /// Original MQTT topic the message arrived on.
    pub topic: String,
    pub received_at: DateTime<Utc>,
    pub payload: PayloadBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
