//! Inbound payload decoding

use bytes::Bytes;
use serde::de::DeserializeOwned;

/// A decoded delivery
///
/// JSON payloads arrive as `Structured`; anything else is handed over
/// untouched as `Raw`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Structured(serde_json::Value),
    Raw(Bytes),
}

impl Payload {
    /// Try a structured decode, fall back to raw bytes
    pub fn decode(bytes: Bytes) -> Self {
        match serde_json::from_slice(&bytes) {
            Ok(value) => Payload::Structured(value),
            Err(_) => Payload::Raw(bytes),
        }
    }

    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Structured(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    /// Deserialize a structured payload into `T`
    pub fn parse<T: DeserializeOwned>(&self) -> Option<T> {
        self.as_structured()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Text rendering; raw bytes must be valid UTF-8
    pub fn as_text(&self) -> Option<String> {
        match self {
            Payload::Structured(value) => Some(value.to_string()),
            Payload::Raw(bytes) => std::str::from_utf8(bytes).ok().map(str::to_string),
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Payload::Structured(value) => Bytes::from(value.to_string()),
            Payload::Raw(bytes) => bytes,
        }
    }
}
