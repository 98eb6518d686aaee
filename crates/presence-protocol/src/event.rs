//! Presence event types.
//!
//! A [`PresenceEvent`] is the canonical unit relayed between edge gateways
//! through the mesh. Its payload is a tagged union holding exactly one
//! record per [`EventKind`], so consumers never look fields up by name.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Presence event kind identifiers.
///
/// The discriminant is the value carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Online = 0x01,
    Offline = 0x02,
    Movement = 0x03,
    Sync = 0x04,
    Ding = 0x05,
    Latency = 0x06,
}

impl EventKind {
    /// All kinds, in discriminant order.
    pub const ALL: [EventKind; 6] = [
        EventKind::Online,
        EventKind::Offline,
        EventKind::Movement,
        EventKind::Sync,
        EventKind::Ding,
        EventKind::Latency,
    ];

    /// The event name used by clients and gateways.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Online => "online",
            EventKind::Offline => "offline",
            EventKind::Movement => "movement",
            EventKind::Sync => "sync",
            EventKind::Ding => "ding",
            EventKind::Latency => "latency",
        }
    }
}

impl From<EventKind> for u8 {
    fn from(kind: EventKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for EventKind {
    /// The unrecognized discriminant.
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(EventKind::Online),
            0x02 => Ok(EventKind::Offline),
            0x03 => Ok(EventKind::Movement),
            0x04 => Ok(EventKind::Sync),
            0x05 => Ok(EventKind::Ding),
            0x06 => Ok(EventKind::Latency),
            other => Err(other),
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point in the shared room plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A user came online somewhere in the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlinePayload {
    /// User id.
    pub name: String,
    /// Avatar reference.
    pub avatar: String,
    /// Country code.
    pub country: String,
    /// Identity of the mesh node the user is connected to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<String>,
}

/// A user went offline. Encoded on the wire as the bare user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflinePayload {
    pub name: String,
}

/// A user moved in a direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementPayload {
    pub name: String,
    #[serde(rename = "dir")]
    pub direction: Position,
}

/// Full state of a user, re-announced for late joiners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub name: String,
    #[serde(rename = "pos")]
    pub position: Position,
    pub avatar: String,
    pub country: String,
}

/// Free-form key/value map carried by `ding` and `latency` probes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProbePayload(pub Map<String, Value>);

impl ProbePayload {
    #[must_use]
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Get a field of the probe.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Consume the probe, returning the raw map.
    #[must_use]
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// Kind-specific payload of a presence event.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Online(OnlinePayload),
    Offline(OfflinePayload),
    Movement(MovementPayload),
    Sync(SyncPayload),
    Ding(ProbePayload),
    Latency(ProbePayload),
}

impl Payload {
    /// Get the event kind of this payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::Online(_) => EventKind::Online,
            Payload::Offline(_) => EventKind::Offline,
            Payload::Movement(_) => EventKind::Movement,
            Payload::Sync(_) => EventKind::Sync,
            Payload::Ding(_) => EventKind::Ding,
            Payload::Latency(_) => EventKind::Latency,
        }
    }

    /// The user id the payload refers to, if it carries one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Payload::Online(p) => Some(&p.name),
            Payload::Offline(p) => Some(&p.name),
            Payload::Movement(p) => Some(&p.name),
            Payload::Sync(p) => Some(&p.name),
            Payload::Ding(p) | Payload::Latency(p) => p.get("name").and_then(Value::as_str),
        }
    }
}

/// A canonical presence event.
///
/// Immutable once constructed; all timestamps are milliseconds since the
/// Unix epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    /// Target room for fan-out.
    pub room: String,
    /// Event timestamp.
    pub timestamp: i64,
    /// Kind-specific payload.
    pub payload: Payload,
}

impl PresenceEvent {
    /// Create a new event.
    #[must_use]
    pub fn new(room: impl Into<String>, timestamp: i64, payload: Payload) -> Self {
        Self {
            room: room.into(),
            timestamp,
            payload,
        }
    }

    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Create an online event.
    #[must_use]
    pub fn online(room: impl Into<String>, timestamp: i64, payload: OnlinePayload) -> Self {
        Self::new(room, timestamp, Payload::Online(payload))
    }

    /// Create an offline event for a bare user id.
    #[must_use]
    pub fn offline(room: impl Into<String>, timestamp: i64, name: impl Into<String>) -> Self {
        Self::new(
            room,
            timestamp,
            Payload::Offline(OfflinePayload { name: name.into() }),
        )
    }

    /// Create a movement event.
    #[must_use]
    pub fn movement(
        room: impl Into<String>,
        timestamp: i64,
        name: impl Into<String>,
        direction: Position,
    ) -> Self {
        Self::new(
            room,
            timestamp,
            Payload::Movement(MovementPayload {
                name: name.into(),
                direction,
            }),
        )
    }

    /// Create a sync event.
    #[must_use]
    pub fn sync(room: impl Into<String>, timestamp: i64, payload: SyncPayload) -> Self {
        Self::new(room, timestamp, Payload::Sync(payload))
    }

    /// Create a ding probe.
    #[must_use]
    pub fn ding(room: impl Into<String>, timestamp: i64, probe: ProbePayload) -> Self {
        Self::new(room, timestamp, Payload::Ding(probe))
    }

    /// Create a latency probe.
    #[must_use]
    pub fn latency(room: impl Into<String>, timestamp: i64, probe: ProbePayload) -> Self {
        Self::new(room, timestamp, Payload::Latency(probe))
    }
}
