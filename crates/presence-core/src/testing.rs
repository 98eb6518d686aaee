//! In-memory gateway and mesh used by unit tests.

use crate::gateway::{ConnectionId, Gateway};
use bytes::Bytes;
use presence_protocol::{codec, PresenceEvent};
use presence_transport::{MeshSink, TransportError};
use serde_json::Value;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Join(ConnectionId, String),
    Leave(ConnectionId, String),
    Broadcast(String, String, Option<Value>),
}

#[derive(Default)]
pub struct RecordingGateway {
    pub calls: Mutex<Vec<GatewayCall>>,
}

impl RecordingGateway {
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn broadcasts(&self) -> Vec<(String, String, Option<Value>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Broadcast(room, event, data) => Some((room, event, data)),
                _ => None,
            })
            .collect()
    }
}

impl Gateway for RecordingGateway {
    fn join_room(&self, connection_id: &ConnectionId, room: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(GatewayCall::Join(connection_id.clone(), room.to_string()));
    }

    fn leave_room(&self, connection_id: &ConnectionId, room: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(GatewayCall::Leave(connection_id.clone(), room.to_string()));
    }

    fn broadcast_to_room(&self, room: &str, event: &str, data: Option<Value>) -> usize {
        self.calls.lock().unwrap().push(GatewayCall::Broadcast(
            room.to_string(),
            event.to_string(),
            data,
        ));
        1
    }
}

#[derive(Default)]
pub struct RecordingMesh {
    pub frames: Mutex<Vec<Bytes>>,
    pub fail: bool,
    pub down: bool,
}

impl RecordingMesh {
    /// Reports itself available but refuses every frame.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Reports itself unavailable.
    pub fn down() -> Self {
        Self {
            down: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<PresenceEvent> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| codec::decode(f).unwrap())
            .collect()
    }
}

impl MeshSink for RecordingMesh {
    fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::ConnectionClosed);
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn is_available(&self) -> bool {
        !self.down
    }
}
