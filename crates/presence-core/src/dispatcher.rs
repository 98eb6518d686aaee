//! Relay from gateway events to the mesh.
//!
//! The dispatcher turns client events into canonical presence events and
//! queues them on the shared mesh sink. Nothing here fails the connection:
//! bad or premature events are logged and dropped, and mesh failures never
//! reach the client. While the mesh is unreachable and
//! [`RelayConfig::local_fallback`](crate::RelayConfig) is set, events are
//! delivered straight to the local room instead.

use crate::context::{now_millis, RelayContext};
use crate::gateway::{ConnectionId, GatewayEvent, MovementRequest, OnlineRequest, SyncRequest};
use crate::room::validate_room_name;
use crate::session::{Identity, IdentityChange, Session, SessionError};
use presence_protocol::{codec, EventKind, OnlinePayload, Payload, PresenceEvent, ProbePayload, SyncPayload};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Why an event was not relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Event from a connection that has not sent `online`.
    Unidentified,
    /// Payload did not match the event schema.
    Malformed,
    /// Event name the relay does not handle.
    UnknownEvent,
    /// `online` with a different user id than the session's.
    IdentityConflict,
    /// Connect for a connection that already has a session.
    DuplicateSession,
    /// The event could not be encoded.
    Encode,
    /// The mesh sink refused the frame.
    MeshUnavailable,
}

impl DropReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Unidentified => "unidentified",
            DropReason::Malformed => "malformed",
            DropReason::UnknownEvent => "unknown_event",
            DropReason::IdentityConflict => "identity_conflict",
            DropReason::DuplicateSession => "duplicate_session",
            DropReason::Encode => "encode",
            DropReason::MeshUnavailable => "mesh_unavailable",
        }
    }
}

/// Result of handling one gateway event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled without producing a mesh frame.
    Handled,
    /// A frame of this kind was queued for the mesh.
    Forwarded(EventKind),
    /// The mesh was unreachable; the event went to the local room only.
    Local(EventKind),
    /// The event was dropped.
    Dropped(DropReason),
}

/// Bridges gateway events to the mesh outbound stream.
#[derive(Clone)]
pub struct RelayDispatcher {
    ctx: Arc<RelayContext>,
}

impl RelayDispatcher {
    #[must_use]
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Handle a raw client event.
    pub fn handle(&self, connection_id: &ConnectionId, name: &str, payload: Value) -> Outcome {
        match GatewayEvent::parse(name, payload) {
            Ok(event) => self.dispatch(connection_id, event),
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Dropping malformed event");
                Outcome::Dropped(DropReason::Malformed)
            }
        }
    }

    /// Handle a parsed client event.
    pub fn dispatch(&self, connection_id: &ConnectionId, event: GatewayEvent) -> Outcome {
        trace!(connection = %connection_id, event = %event.name(), "Client event");
        match event {
            GatewayEvent::Online(req) => self.on_online(connection_id, req),
            GatewayEvent::Movement(req) => self.on_movement(connection_id, req),
            GatewayEvent::Sync(req) => self.on_sync(connection_id, req),
            GatewayEvent::Ding(map) => self.on_ding(connection_id, map),
            GatewayEvent::Latency(map) => self.on_latency(connection_id, map),
            GatewayEvent::Unknown(name) => {
                debug!(connection = %connection_id, event = %name, "Ignoring unknown event");
                Outcome::Dropped(DropReason::UnknownEvent)
            }
        }
    }

    /// A connection opened. The room is unknown until `online`.
    pub fn on_connect(&self, connection_id: &ConnectionId) -> Outcome {
        match self.ctx.sessions.create(connection_id) {
            Ok(_) => Outcome::Handled,
            Err(_) => Outcome::Dropped(DropReason::DuplicateSession),
        }
    }

    /// A client announced itself.
    pub fn on_online(&self, connection_id: &ConnectionId, req: OnlineRequest) -> Outcome {
        if req.name.is_empty() {
            warn!(connection = %connection_id, "Dropping online event without a name");
            return Outcome::Dropped(DropReason::Malformed);
        }

        let config = &self.ctx.config;
        let room = non_empty(req.room).unwrap_or_else(|| config.default_room.clone());
        let country = non_empty(req.country).unwrap_or_else(|| config.default_country.clone());
        if let Err(reason) = validate_room_name(&room) {
            warn!(connection = %connection_id, room = %room, reason, "Dropping online event");
            return Outcome::Dropped(DropReason::Malformed);
        }

        let change = match self.ctx.sessions.set_identity(
            connection_id,
            &req.name,
            &room,
            Some(country.as_str()),
            Some(req.avatar.as_str()),
        ) {
            Ok(change) => change,
            Err(e @ SessionError::IdentityConflict { .. }) => {
                warn!(connection = %connection_id, error = %e, "Dropping online event");
                return Outcome::Dropped(DropReason::IdentityConflict);
            }
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Dropping online event");
                return Outcome::Dropped(DropReason::Unidentified);
            }
        };

        match change {
            IdentityChange::New => self.ctx.gateway.join_room(connection_id, &room),
            IdentityChange::RoomChanged { previous } => {
                self.ctx.gateway.leave_room(connection_id, &previous);
                self.ctx.gateway.join_room(connection_id, &room);
            }
            IdentityChange::Unchanged => {}
        }

        info!(connection = %connection_id, user = %req.name, room = %room, "User online");

        let event = PresenceEvent::online(
            room,
            now_millis(),
            OnlinePayload {
                name: req.name,
                avatar: req.avatar,
                country,
                mesh: Some(config.mesh_id.clone()),
            },
        );
        self.forward(connection_id, event)
    }

    /// A client moved.
    pub fn on_movement(&self, connection_id: &ConnectionId, req: MovementRequest) -> Outcome {
        let Some((identity, _)) = self.identified(connection_id, "movement") else {
            return Outcome::Dropped(DropReason::Unidentified);
        };

        let timestamp = req.timestamp.unwrap_or_else(now_millis);
        let event = PresenceEvent::movement(
            identity.room_id,
            timestamp,
            identity.user_id,
            req.direction,
        );
        self.forward(connection_id, event)
    }

    /// A client re-announced its full state.
    pub fn on_sync(&self, connection_id: &ConnectionId, req: SyncRequest) -> Outcome {
        let Some((identity, session)) = self.identified(connection_id, "sync") else {
            return Outcome::Dropped(DropReason::Unidentified);
        };

        let avatar_update = non_empty(req.avatar);
        let country_update = non_empty(req.country);
        if let Err(e) = self.ctx.sessions.update_metadata(
            connection_id,
            country_update.as_deref(),
            avatar_update.as_deref(),
        ) {
            debug!(connection = %connection_id, error = %e, "Session vanished during sync");
        }

        let avatar = avatar_update.or(session.avatar).unwrap_or_default();
        let country = country_update
            .or(session.country)
            .unwrap_or_else(|| self.ctx.config.default_country.clone());

        let timestamp = req.timestamp.unwrap_or_else(now_millis);
        let event = PresenceEvent::sync(
            identity.room_id,
            timestamp,
            SyncPayload {
                name: identity.user_id,
                position: req.position,
                avatar,
                country,
            },
        );
        self.forward(connection_id, event)
    }

    /// A liveness probe; stamped with the sender and `timestamp`.
    pub fn on_ding(&self, connection_id: &ConnectionId, map: Map<String, Value>) -> Outcome {
        self.probe(connection_id, "ding", map, "timestamp", Payload::Ding)
    }

    /// A latency probe; stamped with the sender and `latency`.
    pub fn on_latency(&self, connection_id: &ConnectionId, map: Map<String, Value>) -> Outcome {
        self.probe(connection_id, "latency", map, "latency", Payload::Latency)
    }

    /// A connection closed.
    pub fn on_disconnect(&self, connection_id: &ConnectionId, reason: &str) -> Outcome {
        let session = match self.ctx.sessions.remove(connection_id) {
            Ok(session) => session,
            Err(e) => {
                debug!(connection = %connection_id, error = %e, "Disconnect without session");
                return Outcome::Handled;
            }
        };

        let Some(identity) = session.identity else {
            debug!(connection = %connection_id, reason = %reason, "Closed before online");
            return Outcome::Handled;
        };

        let connected_ms = (now_millis() as u64).saturating_sub(session.connected_at);
        info!(
            connection = %connection_id,
            user = %identity.user_id,
            room = %identity.room_id,
            reason = %reason,
            connected_ms,
            "User offline"
        );

        let room = identity.room_id.clone();
        let event = PresenceEvent::offline(identity.room_id, now_millis(), identity.user_id);
        let outcome = self.forward(connection_id, event);
        self.ctx.gateway.leave_room(connection_id, &room);
        outcome
    }

    fn probe(
        &self,
        connection_id: &ConnectionId,
        event: &str,
        mut map: Map<String, Value>,
        stamp_key: &str,
        wrap: fn(ProbePayload) -> Payload,
    ) -> Outcome {
        let Some((identity, _)) = self.identified(connection_id, event) else {
            return Outcome::Dropped(DropReason::Unidentified);
        };

        map.insert("name".to_string(), Value::String(identity.user_id));

        let timestamp = match map.get(stamp_key).and_then(Value::as_i64) {
            Some(ts) => ts,
            None => {
                let now = now_millis();
                map.insert(stamp_key.to_string(), Value::from(now));
                now
            }
        };

        let event = PresenceEvent::new(identity.room_id, timestamp, wrap(ProbePayload::new(map)));
        self.forward(connection_id, event)
    }

    fn identified(&self, connection_id: &ConnectionId, event: &str) -> Option<(Identity, Session)> {
        match self.ctx.sessions.identified(connection_id) {
            Ok(found) => Some(found),
            Err(e) => {
                warn!(connection = %connection_id, event = %event, error = %e, "Dropping event from unidentified connection");
                None
            }
        }
    }

    fn forward(&self, connection_id: &ConnectionId, event: PresenceEvent) -> Outcome {
        let fallback = self.ctx.config.local_fallback;
        if fallback && !self.ctx.mesh.is_available() {
            return self.deliver_locally(connection_id, event);
        }

        let kind = event.kind();
        let frame = match codec::encode(&event) {
            Ok(frame) => frame,
            Err(e) => {
                error!(connection = %connection_id, kind = %kind, error = %e, "Failed to encode event");
                return Outcome::Dropped(DropReason::Encode);
            }
        };

        match self.ctx.mesh.write(frame) {
            Ok(()) => {
                trace!(connection = %connection_id, kind = %kind, room = %event.room, "Forwarded to mesh");
                Outcome::Forwarded(kind)
            }
            Err(e) if fallback => {
                warn!(connection = %connection_id, kind = %kind, error = %e, "Mesh write failed, delivering locally");
                self.deliver_locally(connection_id, event)
            }
            Err(e) => {
                warn!(connection = %connection_id, kind = %kind, error = %e, "Mesh write failed, event dropped");
                Outcome::Dropped(DropReason::MeshUnavailable)
            }
        }
    }

    fn deliver_locally(&self, connection_id: &ConnectionId, event: PresenceEvent) -> Outcome {
        let kind = event.kind();
        debug!(connection = %connection_id, kind = %kind, room = %event.room, "Mesh unreachable, delivering locally");
        self.ctx.broadcaster.deliver(event);
        Outcome::Local(kind)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RelayConfig;
    use crate::rooms::RoomTable;
    use crate::testing::{GatewayCall, RecordingGateway, RecordingMesh};
    use presence_protocol::Position;
    use serde_json::json;

    struct Harness {
        dispatcher: RelayDispatcher,
        gateway: Arc<RecordingGateway>,
        mesh: Arc<RecordingMesh>,
    }

    fn harness_with(mesh: RecordingMesh) -> Harness {
        let gateway = Arc::new(RecordingGateway::default());
        let mesh = Arc::new(mesh);
        let config = RelayConfig {
            mesh_id: "eu-west".into(),
            ..RelayConfig::default()
        };
        let ctx = Arc::new(RelayContext::new(config, gateway.clone(), mesh.clone()));
        Harness {
            dispatcher: RelayDispatcher::new(ctx),
            gateway,
            mesh,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingMesh::default())
    }

    fn online(h: &Harness, c: &ConnectionId, name: &str, room: &str) -> Outcome {
        h.dispatcher.handle(
            c,
            "online",
            json!({"name": name, "avatar": "cat", "room": room, "country": "NL"}),
        )
    }

    #[test]
    fn test_session_lifecycle() {
        let h = harness();
        let c = ConnectionId::from("c1");

        assert_eq!(h.dispatcher.on_connect(&c), Outcome::Handled);
        assert_eq!(online(&h, &c, "alice", "room1"), Outcome::Forwarded(EventKind::Online));

        let session = h.dispatcher.context().sessions.get(&c).unwrap();
        assert_eq!(session.user_id(), Some("alice"));
        assert_eq!(session.room_id(), Some("room1"));

        h.dispatcher.on_disconnect(&c, "transport close");
        assert!(matches!(
            h.dispatcher.context().sessions.get(&c),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_online_frame_contents() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        online(&h, &c, "alice", "room1");

        let events = h.mesh.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].room, "room1");
        assert_eq!(
            events[0].payload,
            Payload::Online(OnlinePayload {
                name: "alice".into(),
                avatar: "cat".into(),
                country: "NL".into(),
                mesh: Some("eu-west".into()),
            })
        );
        assert_eq!(
            h.gateway.calls(),
            vec![GatewayCall::Join(c, "room1".into())]
        );
    }

    #[test]
    fn test_online_defaults() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        h.dispatcher.handle(&c, "online", json!({"name": "bob", "room": ""}));

        let session = h.dispatcher.context().sessions.get(&c).unwrap();
        assert_eq!(session.room_id(), Some("void"));
        assert_eq!(session.country.as_deref(), Some("US"));

        let Payload::Online(payload) = &h.mesh.events()[0].payload else {
            panic!("expected online payload");
        };
        assert_eq!(payload.country, "US");
    }

    #[test]
    fn test_online_is_idempotent() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        online(&h, &c, "alice", "room1");
        let before = h.dispatcher.context().sessions.get(&c).unwrap();

        online(&h, &c, "alice", "room1");
        assert_eq!(h.dispatcher.context().sessions.get(&c).unwrap(), before);

        let joins = h
            .gateway
            .calls()
            .into_iter()
            .filter(|call| matches!(call, GatewayCall::Join(..)))
            .count();
        assert_eq!(joins, 1);
    }

    #[test]
    fn test_online_cannot_change_user() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        online(&h, &c, "alice", "room1");

        assert_eq!(
            online(&h, &c, "mallory", "room1"),
            Outcome::Dropped(DropReason::IdentityConflict)
        );
        assert_eq!(h.mesh.events().len(), 1);
    }

    #[test]
    fn test_online_room_change_leaves_previous() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        online(&h, &c, "alice", "room1");
        online(&h, &c, "alice", "room2");

        assert_eq!(
            h.gateway.calls(),
            vec![
                GatewayCall::Join(c.clone(), "room1".into()),
                GatewayCall::Leave(c.clone(), "room1".into()),
                GatewayCall::Join(c, "room2".into()),
            ]
        );
    }

    #[test]
    fn test_online_without_connect() {
        let h = harness();
        let c = ConnectionId::from("ghost");
        assert_eq!(online(&h, &c, "alice", "r"), Outcome::Dropped(DropReason::Unidentified));
        assert!(h.mesh.events().is_empty());
    }

    #[test]
    fn test_movement_before_online_is_dropped() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);

        let outcome = h
            .dispatcher
            .handle(&c, "movement", json!({"dir": {"x": 1.0, "y": 0.0}}));
        assert_eq!(outcome, Outcome::Dropped(DropReason::Unidentified));

        // Never connected at all
        let outcome = h.dispatcher.handle(
            &ConnectionId::from("c2"),
            "movement",
            json!({"dir": {"x": 1.0, "y": 0.0}}),
        );
        assert_eq!(outcome, Outcome::Dropped(DropReason::Unidentified));

        assert!(h.mesh.events().is_empty());
        assert!(h.gateway.broadcasts().is_empty());
    }

    #[test]
    fn test_movement_timestamps() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        online(&h, &c, "alice", "room1");

        h.dispatcher.handle(
            &c,
            "movement",
            json!({"dir": {"x": 0.5, "y": -1.0}, "timestamp": 1234}),
        );
        h.dispatcher
            .handle(&c, "movement", json!({"dir": {"x": 0.0, "y": 1.0}, "timestamp": "bad"}));

        let events = h.mesh.events();
        assert_eq!(
            events[1],
            PresenceEvent::movement("room1", 1234, "alice", Position::new(0.5, -1.0))
        );
        assert_eq!(events[2].kind(), EventKind::Movement);
        assert!(events[2].timestamp > 1234);
    }

    #[test]
    fn test_sync_uses_last_known_metadata() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        online(&h, &c, "alice", "room1");

        h.dispatcher
            .handle(&c, "sync", json!({"pos": {"x": 3.0, "y": 4.0}, "timestamp": 99}));
        h.dispatcher.handle(
            &c,
            "sync",
            json!({"pos": {"x": 5.0, "y": 6.0}, "avatar": "owl", "country": "JP"}),
        );

        let events = h.mesh.events();
        assert_eq!(
            events[1],
            PresenceEvent::sync(
                "room1",
                99,
                SyncPayload {
                    name: "alice".into(),
                    position: Position::new(3.0, 4.0),
                    avatar: "cat".into(),
                    country: "NL".into(),
                }
            )
        );
        let Payload::Sync(latest) = &events[2].payload else {
            panic!("expected sync payload");
        };
        assert_eq!(latest.avatar, "owl");
        assert_eq!(latest.country, "JP");

        let session = h.dispatcher.context().sessions.get(&c).unwrap();
        assert_eq!(session.avatar.as_deref(), Some("owl"));
        assert_eq!(session.country.as_deref(), Some("JP"));
    }

    #[test]
    fn test_probes_are_stamped() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        online(&h, &c, "alice", "room1");

        h.dispatcher
            .handle(&c, "ding", json!({"name": "spoofed", "timestamp": 77, "seq": 1}));
        h.dispatcher.handle(&c, "latency", json!({"rtt": 12}));

        let events = h.mesh.events();
        let Payload::Ding(ding) = &events[1].payload else {
            panic!("expected ding payload");
        };
        assert_eq!(ding.get("name"), Some(&json!("alice")));
        assert_eq!(ding.get("seq"), Some(&json!(1)));
        assert_eq!(events[1].timestamp, 77);

        let Payload::Latency(latency) = &events[2].payload else {
            panic!("expected latency payload");
        };
        assert_eq!(latency.get("rtt"), Some(&json!(12)));
        assert_eq!(latency.get("latency"), Some(&json!(events[2].timestamp)));
    }

    #[test]
    fn test_disconnect_emits_offline() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        online(&h, &c, "carol", "r2");
        h.mesh.frames.lock().unwrap().clear();

        let outcome = h.dispatcher.on_disconnect(&c, "client namespace disconnect");
        assert_eq!(outcome, Outcome::Forwarded(EventKind::Offline));

        let events = h.mesh.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].room, "r2");
        assert_eq!(events[0].kind(), EventKind::Offline);
        assert_eq!(codec::encode_payload(&events[0].payload).unwrap(), b"carol".to_vec());
        assert_eq!(
            h.gateway.calls().last(),
            Some(&GatewayCall::Leave(c, "r2".into()))
        );
    }

    #[test]
    fn test_disconnect_before_online_is_silent() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);

        assert_eq!(h.dispatcher.on_disconnect(&c, "ping timeout"), Outcome::Handled);
        assert_eq!(h.dispatcher.on_disconnect(&c, "again"), Outcome::Handled);
        assert!(h.mesh.events().is_empty());
    }

    fn without_fallback(mesh: RecordingMesh) -> Harness {
        let h = harness_with(mesh);
        let mut config = h.dispatcher.context().config.clone();
        config.local_fallback = false;
        let ctx = RelayContext::new(config, h.gateway.clone(), h.mesh.clone());
        Harness {
            dispatcher: RelayDispatcher::new(Arc::new(ctx)),
            ..h
        }
    }

    #[test]
    fn test_mesh_failure_does_not_break_session() {
        let h = without_fallback(RecordingMesh::failing());
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);

        assert_eq!(
            online(&h, &c, "alice", "room1"),
            Outcome::Dropped(DropReason::MeshUnavailable)
        );
        // Local state still advanced
        assert!(h.dispatcher.context().sessions.get(&c).unwrap().is_identified());
        assert_eq!(h.gateway.calls().len(), 1);
    }

    #[test]
    fn test_unreachable_mesh_delivers_locally() {
        let h = harness_with(RecordingMesh::down());
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);

        assert_eq!(online(&h, &c, "alice", "room1"), Outcome::Local(EventKind::Online));
        assert_eq!(
            h.dispatcher
                .handle(&c, "movement", json!({"dir": {"x": 1.0, "y": 0.0}, "timestamp": 5})),
            Outcome::Local(EventKind::Movement)
        );
        assert!(h.mesh.events().is_empty());

        let broadcasts = h.gateway.broadcasts();
        let events: Vec<_> = broadcasts.iter().map(|(_, event, _)| event.as_str()).collect();
        assert_eq!(events, ["online", "ask", "movement"]);

        let (room, _, data) = &broadcasts[0];
        assert_eq!(room, "room1");
        let data = data.as_ref().unwrap();
        assert_eq!(data["name"], json!("alice"));
        assert_eq!(data["mesh"], json!("eu-west"));

        assert_eq!(
            broadcasts[2].2,
            Some(json!({"name": "alice", "direction": {"x": 1.0, "y": 0.0}, "timestamp": 5}))
        );
    }

    #[test]
    fn test_failed_mesh_write_delivers_locally() {
        let h = harness_with(RecordingMesh::failing());
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        online(&h, &c, "alice", "room1");

        assert_eq!(
            h.dispatcher.on_disconnect(&c, "transport close"),
            Outcome::Local(EventKind::Offline)
        );
        assert!(h
            .gateway
            .broadcasts()
            .contains(&("room1".into(), "offline".into(), Some(json!({"name": "alice"})))));
    }

    #[test]
    fn test_ding_from_unidentified_connection() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);

        assert_eq!(
            h.dispatcher.handle(&c, "ding", json!({"seq": 1})),
            Outcome::Dropped(DropReason::Unidentified)
        );
        assert!(h.mesh.events().is_empty());
    }

    fn room_table_dispatcher() -> (RelayDispatcher, Arc<RoomTable>, Arc<RecordingMesh>) {
        let rooms = Arc::new(RoomTable::new());
        let mesh = Arc::new(RecordingMesh::down());
        let ctx = RelayContext::new(RelayConfig::default(), rooms.clone(), mesh.clone());
        (RelayDispatcher::new(Arc::new(ctx)), rooms, mesh)
    }

    #[tokio::test]
    async fn test_unicode_room_is_joined() {
        let (dispatcher, rooms, _mesh) = room_table_dispatcher();
        let c = ConnectionId::from("c1");
        let mut outbox = rooms.register(&c);
        dispatcher.on_connect(&c);

        let outcome = dispatcher.handle(&c, "online", json!({"name": "alice", "room": "café"}));
        assert_eq!(outcome, Outcome::Local(EventKind::Online));
        assert_eq!(rooms.rooms_of(&c), vec!["café".to_string()]);

        let echoed = tokio::time::timeout(std::time::Duration::from_secs(1), outbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed.event, "online");
    }

    #[tokio::test]
    async fn test_invalid_room_is_rejected() {
        let (dispatcher, rooms, _mesh) = room_table_dispatcher();
        let c = ConnectionId::from("c1");
        let _outbox = rooms.register(&c);
        dispatcher.on_connect(&c);

        for room in ["bad\nroom".to_string(), "x".repeat(257)] {
            let outcome = dispatcher.handle(&c, "online", json!({"name": "alice", "room": room}));
            assert_eq!(outcome, Outcome::Dropped(DropReason::Malformed));
        }
        assert!(!dispatcher.context().sessions.get(&c).unwrap().is_identified());
        assert!(rooms.rooms_of(&c).is_empty());

        // Nothing announced, so a valid retry still joins
        let outcome = dispatcher.handle(&c, "online", json!({"name": "alice", "room": "会議室"}));
        assert_eq!(outcome, Outcome::Local(EventKind::Online));
        assert_eq!(rooms.rooms_of(&c), vec!["会議室".to_string()]);
    }

    #[test]
    fn test_invalid_room_writes_nothing_to_mesh() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);

        assert_eq!(
            online(&h, &c, "alice", "bad\u{7}bell"),
            Outcome::Dropped(DropReason::Malformed)
        );
        assert!(h.mesh.events().is_empty());
        assert!(h.gateway.calls().is_empty());
    }

    #[test]
    fn test_unknown_and_malformed_events() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        online(&h, &c, "alice", "room1");

        assert_eq!(
            h.dispatcher.handle(&c, "teleport", json!({})),
            Outcome::Dropped(DropReason::UnknownEvent)
        );
        assert_eq!(
            h.dispatcher.handle(&c, "movement", json!({"dir": "north"})),
            Outcome::Dropped(DropReason::Malformed)
        );
        assert_eq!(h.mesh.events().len(), 1);
    }

    #[test]
    fn test_duplicate_connect() {
        let h = harness();
        let c = ConnectionId::from("c1");
        h.dispatcher.on_connect(&c);
        assert_eq!(
            h.dispatcher.on_connect(&c),
            Outcome::Dropped(DropReason::DuplicateSession)
        );
    }
}
