//! The connection gateway seam and the events it delivers.
//!
//! The gateway owns client connections and room membership. The relay only
//! asks it to join, leave, and broadcast, and receives typed
//! [`GatewayEvent`]s parsed from the raw `(name, payload)` pairs clients send.

use presence_protocol::Position;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Counter for connection identities issued by this process.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque connection identity issued by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique identity prefixed with the mesh identity,
    /// e.g. `eu-west-17`.
    #[must_use]
    pub fn generate(mesh_id: &str) -> Self {
        let n = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{mesh_id}-{n}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Room primitives provided by the connection gateway.
///
/// Implementations serialize their own membership table; all methods are
/// best-effort and never fail the caller.
pub trait Gateway: Send + Sync {
    /// Add a connection to a room. Joining a room twice is a no-op.
    fn join_room(&self, connection_id: &ConnectionId, room: &str);

    /// Remove a connection from a room.
    fn leave_room(&self, connection_id: &ConnectionId, room: &str);

    /// Send an event to every connection in a room.
    ///
    /// Returns the number of connections the event was handed to.
    fn broadcast_to_room(&self, room: &str, event: &str, data: Option<Value>) -> usize;
}

/// Errors raised while interpreting a client event.
#[derive(Debug, Error, PartialEq)]
pub enum EventError {
    /// The payload does not match the event's schema.
    #[error("Malformed {event} payload: {reason}")]
    Malformed {
        /// Event name.
        event: &'static str,
        /// Parser message.
        reason: String,
    },
}

/// Payload of an `online` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OnlineRequest {
    /// User id.
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Payload of a `movement` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MovementRequest {
    #[serde(rename = "dir")]
    pub direction: Position,
    /// Client clock, milliseconds. Ignored unless a non-negative integer.
    #[serde(default, deserialize_with = "client_timestamp")]
    pub timestamp: Option<i64>,
}

/// Payload of a `sync` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncRequest {
    #[serde(rename = "pos")]
    pub position: Position,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "client_timestamp")]
    pub timestamp: Option<i64>,
}

/// An event received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Online(OnlineRequest),
    Movement(MovementRequest),
    Sync(SyncRequest),
    Ding(Map<String, Value>),
    Latency(Map<String, Value>),
    /// An event name the relay does not handle.
    Unknown(String),
}

impl GatewayEvent {
    /// Interpret a raw client event.
    ///
    /// Unrecognized names become [`GatewayEvent::Unknown`] rather than an error.
    ///
    /// # Errors
    ///
    /// Returns an error if a recognized event carries a malformed payload.
    pub fn parse(name: &str, payload: Value) -> Result<Self, EventError> {
        let event = match name {
            "online" => GatewayEvent::Online(typed("online", payload)?),
            "movement" => GatewayEvent::Movement(typed("movement", payload)?),
            "sync" => GatewayEvent::Sync(typed("sync", payload)?),
            "ding" => GatewayEvent::Ding(object("ding", payload)?),
            "latency" => GatewayEvent::Latency(object("latency", payload)?),
            other => GatewayEvent::Unknown(other.to_string()),
        };
        Ok(event)
    }

    /// The client-facing event name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            GatewayEvent::Online(_) => "online",
            GatewayEvent::Movement(_) => "movement",
            GatewayEvent::Sync(_) => "sync",
            GatewayEvent::Ding(_) => "ding",
            GatewayEvent::Latency(_) => "latency",
            GatewayEvent::Unknown(name) => name,
        }
    }
}

fn typed<T: for<'de> Deserialize<'de>>(event: &'static str, payload: Value) -> Result<T, EventError> {
    serde_json::from_value(payload).map_err(|e| EventError::Malformed {
        event,
        reason: e.to_string(),
    })
}

fn object(event: &'static str, payload: Value) -> Result<Map<String, Value>, EventError> {
    match payload {
        Value::Object(map) => Ok(map),
        // A probe without fields is still a probe
        Value::Null => Ok(Map::new()),
        other => Err(EventError::Malformed {
            event,
            reason: format!("expected an object, got {other}"),
        }),
    }
}

fn client_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_i64()).filter(|ts| *ts >= 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_id_generation() {
        let a = ConnectionId::generate("eu");
        let b = ConnectionId::generate("eu");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("eu-"));
    }

    #[test]
    fn test_parse_online() {
        let event = GatewayEvent::parse(
            "online",
            json!({"name": "alice", "avatar": "cat", "room": "room1"}),
        )
        .unwrap();

        assert_eq!(
            event,
            GatewayEvent::Online(OnlineRequest {
                name: "alice".into(),
                avatar: "cat".into(),
                room: Some("room1".into()),
                country: None,
            })
        );
    }

    #[test]
    fn test_parse_online_requires_name() {
        let err = GatewayEvent::parse("online", json!({"avatar": "cat"})).unwrap_err();
        assert!(matches!(err, EventError::Malformed { event: "online", .. }));
    }

    #[test]
    fn test_parse_movement_timestamp() {
        let event = GatewayEvent::parse(
            "movement",
            json!({"dir": {"x": 1.0, "y": -0.5}, "timestamp": 1_700_000_000_000_i64}),
        )
        .unwrap();
        let GatewayEvent::Movement(movement) = event else {
            panic!("expected movement");
        };
        assert_eq!(movement.direction, Position::new(1.0, -0.5));
        assert_eq!(movement.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn test_malformed_timestamp_is_ignored() {
        for ts in [json!("soon"), json!(-5), json!(1.5), json!(null)] {
            let event =
                GatewayEvent::parse("movement", json!({"dir": {"x": 0, "y": 0}, "timestamp": ts}))
                    .unwrap();
            let GatewayEvent::Movement(movement) = event else {
                panic!("expected movement");
            };
            assert_eq!(movement.timestamp, None);
        }
    }

    #[test]
    fn test_parse_probes() {
        let event = GatewayEvent::parse("ding", json!({"seq": 1})).unwrap();
        assert_eq!(event.name(), "ding");

        let event = GatewayEvent::parse("latency", Value::Null).unwrap();
        assert_eq!(event, GatewayEvent::Latency(Map::new()));

        assert!(GatewayEvent::parse("latency", json!([1, 2])).is_err());
    }

    #[test]
    fn test_parse_unknown() {
        let event = GatewayEvent::parse("teleport", json!({})).unwrap();
        assert_eq!(event, GatewayEvent::Unknown("teleport".into()));
        assert_eq!(event.name(), "teleport");
    }
}
