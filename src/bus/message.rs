//! Heartbeat message definition and JSON frame encoding.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Kind tag used by the publisher loop.
pub const HEARTBEAT_KIND: &str = "heartbeat";

/// A tagged message sent over a transport.
///
/// Messages are immutable once built: fields are only readable through
/// accessors, and the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    id: String,
    created_at: DateTime<Utc>,
    kind: String,
    #[serde(default)]
    payload: HashMap<String, serde_json::Value>,
}

impl HeartbeatMessage {
    /// Create a message of the given kind with a fresh identifier and an empty payload.
    pub fn new(kind: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            kind: kind.to_string(),
            payload: HashMap::new(),
        }
    }

    /// Create a message with `kind = "heartbeat"`.
    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT_KIND)
    }

    /// Add a payload entry.
    pub fn with_payload(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &HashMap<String, serde_json::Value> {
        &self.payload
    }

    /// Look up a single payload value.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }

    /// Encode as a single-line JSON frame (no trailing newline).
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON frame produced by [`HeartbeatMessage::to_frame`].
    pub fn from_frame(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame.trim())?)
    }
}
