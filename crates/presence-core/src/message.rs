//! Messages fanned out to gateway connections.

use serde::Serialize;
use serde_json::Value;

/// An event delivered to every connection in a room.
///
/// Serializes to the client envelope `{"event": ..., "data": ...}`; `data`
/// is omitted for bare events such as `ask`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Broadcast {
    /// Target room.
    #[serde(skip)]
    pub room: String,
    /// Client-facing event name.
    pub event: String,
    /// Event data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Broadcast {
    #[must_use]
    pub fn new(room: impl Into<String>, event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            room: room.into(),
            event: event.into(),
            data,
        }
    }

    /// Render the client envelope.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!(r#"{{"event":"{}"}}"#, self.event))
    }
}
