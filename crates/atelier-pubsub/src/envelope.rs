//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Message envelope and wire codec."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{PubSubError, Result};

/// Unit delivered to handlers: where it was published, what, by whom and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Canonical (unprefixed) channel name.
    pub channel: String,
    /// Opaque application payload.
    #[serde(default)]
    pub payload: JsonValue,
    /// Instance identifier of the adapter that produced the message.
    pub sender_id: String,
    /// Milliseconds since the Unix epoch at publish time.
    pub timestamp: i64,
}

impl Envelope {
    /// Stamp a new envelope with the current time.
    pub fn new(
        channel: impl Into<String>,
        payload: JsonValue,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            payload,
            sender_id: sender_id.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Encode for a broker transport.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a payload received on `channel`.
    pub fn from_wire(channel: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|source| PubSubError::MalformedMessage {
            channel: channel.to_owned(),
            source,
        })
    }
}
