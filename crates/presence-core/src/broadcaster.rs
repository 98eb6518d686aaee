//! Fan-out to the gateway's rooms.

use crate::gateway::Gateway;
use presence_protocol::{Payload, PresenceEvent};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::trace;

/// Thin wrapper over [`Gateway::broadcast_to_room`].
///
/// Best-effort: no buffering, no retry. Connections that are gone simply
/// miss the broadcast.
#[derive(Clone)]
pub struct RoomBroadcaster {
    gateway: Arc<dyn Gateway>,
}

impl RoomBroadcaster {
    #[must_use]
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    /// Broadcast `event` with `data` to every connection in `room`.
    pub fn broadcast(&self, room: &str, event: &str, data: Value) -> usize {
        let count = self.gateway.broadcast_to_room(room, event, Some(data));
        trace!(room = %room, event = %event, recipients = count, "Broadcast");
        count
    }

    /// Broadcast an event without data.
    pub fn broadcast_bare(&self, room: &str, event: &str) -> usize {
        let count = self.gateway.broadcast_to_room(room, event, None);
        trace!(room = %room, event = %event, recipients = count, "Broadcast");
        count
    }

    /// Deliver a presence event to its room in client form.
    ///
    /// `online` is followed by a bare `ask` so existing members re-announce
    /// themselves; `ding` comes back as `dang`.
    pub fn deliver(&self, event: PresenceEvent) {
        let PresenceEvent {
            room,
            timestamp,
            payload,
        } = event;
        trace!(room = %room, kind = %payload.kind(), user = ?payload.name(), "Delivering event");

        match payload {
            Payload::Online(p) => {
                let mut data = Map::new();
                data.insert("name".into(), Value::String(p.name));
                data.insert("timestamp".into(), Value::from(timestamp));
                data.insert("avatar".into(), Value::String(p.avatar));
                data.insert("country".into(), Value::String(p.country));
                if let Some(mesh) = p.mesh {
                    data.insert("mesh".into(), Value::String(mesh));
                }
                self.broadcast(&room, "online", Value::Object(data));
                self.broadcast_bare(&room, "ask");
            }
            Payload::Offline(p) => {
                self.broadcast(&room, "offline", json!({ "name": p.name }));
            }
            Payload::Movement(p) => {
                self.broadcast(
                    &room,
                    "movement",
                    json!({
                        "name": p.name,
                        "direction": { "x": p.direction.x, "y": p.direction.y },
                        "timestamp": timestamp,
                    }),
                );
            }
            Payload::Sync(p) => {
                self.broadcast(
                    &room,
                    "sync",
                    json!({
                        "name": p.name,
                        "position": { "x": p.position.x, "y": p.position.y },
                        "avatar": p.avatar,
                        "country": p.country,
                        "timestamp": timestamp,
                    }),
                );
            }
            Payload::Ding(probe) => {
                self.broadcast(&room, "dang", Value::Object(probe.into_inner()));
            }
            Payload::Latency(probe) => {
                self.broadcast(&room, "latency", Value::Object(probe.into_inner()));
            }
        }
    }
}

impl std::fmt::Debug for RoomBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomBroadcaster").finish_non_exhaustive()
    }
}
