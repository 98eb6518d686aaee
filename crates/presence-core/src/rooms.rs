//! In-process room table.
//!
//! [`RoomTable`] is the gateway's room membership table. Each connection
//! registers an outbox; joining a room forwards that room's broadcast
//! channel into the outbox until the connection leaves.

use crate::gateway::{ConnectionId, Gateway};
use crate::message::Broadcast;
use crate::room::{validate_room_name, Room};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Room table errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The connection never registered an outbox.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Not a member of the room.
    #[error("Not a member of room: {0}")]
    NotJoined(String),

    /// Maximum number of rooms reached.
    #[error("Maximum rooms reached")]
    MaxRoomsReached,

    /// Maximum rooms per connection reached.
    #[error("Maximum rooms per connection reached")]
    MaxMembershipsReached,
}

/// Room table configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Maximum rooms a connection may be in.
    pub max_rooms_per_connection: usize,
    /// Per-room broadcast capacity.
    pub room_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            max_rooms_per_connection: 16,
            room_capacity: 1024,
        }
    }
}

/// A registered connection.
struct Member {
    outbox: mpsc::UnboundedSender<Arc<Broadcast>>,
    /// Forwarding task per joined room.
    forwards: HashMap<String, JoinHandle<()>>,
}

/// The room membership table.
pub struct RoomTable {
    rooms: DashMap<String, Room>,
    members: DashMap<ConnectionId, Member>,
    config: RoomConfig,
}

impl RoomTable {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RoomConfig::default())
    }

    #[must_use]
    pub fn with_config(config: RoomConfig) -> Self {
        info!("Creating room table with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            members: DashMap::new(),
            config,
        }
    }

    /// Register a connection, returning the receiver of everything
    /// broadcast to rooms it joins.
    pub fn register(&self, connection_id: &ConnectionId) -> mpsc::UnboundedReceiver<Arc<Broadcast>> {
        let (outbox, rx) = mpsc::unbounded_channel();
        let previous = self.members.insert(
            connection_id.clone(),
            Member {
                outbox,
                forwards: HashMap::new(),
            },
        );
        if let Some(previous) = previous {
            warn!(connection = %connection_id, "Connection registered twice, replacing outbox");
            for (_, handle) in previous.forwards {
                handle.abort();
            }
        }
        rx
    }

    /// Remove a connection from every room and drop its outbox.
    pub fn unregister(&self, connection_id: &ConnectionId) {
        let Some((_, member)) = self.members.remove(connection_id) else {
            return;
        };

        for (room_name, handle) in member.forwards {
            handle.abort();
            self.remove_member(connection_id, &room_name);
        }

        debug!(connection = %connection_id, "Connection unregistered");
    }

    /// Add a connection to a room.
    ///
    /// Returns `false` if the connection was already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid, the connection is not
    /// registered, or limits are exceeded.
    pub fn join(&self, connection_id: &ConnectionId, room_name: &str) -> Result<bool, RoomError> {
        validate_room_name(room_name).map_err(RoomError::InvalidRoom)?;

        let mut member = self
            .members
            .get_mut(connection_id)
            .ok_or_else(|| RoomError::UnknownConnection(connection_id.clone()))?;

        if member.forwards.contains_key(room_name) {
            return Ok(false);
        }
        if member.forwards.len() >= self.config.max_rooms_per_connection {
            return Err(RoomError::MaxMembershipsReached);
        }
        if !self.rooms.contains_key(room_name) && self.rooms.len() >= self.config.max_rooms {
            return Err(RoomError::MaxRoomsReached);
        }

        let rx = self
            .rooms
            .entry(room_name.to_string())
            .or_insert_with(|| {
                debug!(room = %room_name, "Creating room");
                Room::with_capacity(room_name, self.config.room_capacity)
            })
            .join(connection_id.clone());

        let handle = tokio::spawn(forward(
            rx,
            member.outbox.clone(),
            connection_id.clone(),
            room_name.to_string(),
        ));
        member.forwards.insert(room_name.to_string(), handle);

        Ok(true)
    }

    /// Remove a connection from a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not in the room.
    pub fn leave(&self, connection_id: &ConnectionId, room_name: &str) -> Result<(), RoomError> {
        let handle = self
            .members
            .get_mut(connection_id)
            .and_then(|mut member| member.forwards.remove(room_name))
            .ok_or_else(|| RoomError::NotJoined(room_name.to_string()))?;

        handle.abort();
        self.remove_member(connection_id, room_name);
        Ok(())
    }

    fn remove_member(&self, connection_id: &ConnectionId, room_name: &str) {
        let now_empty = match self.rooms.get_mut(room_name) {
            Some(mut room) => {
                room.leave(connection_id);
                room.is_empty()
            }
            None => false,
        };

        if now_empty {
            // Re-check under the entry lock; someone may have joined meanwhile
            if self.rooms.remove_if(room_name, |_, room| room.is_empty()).is_some() {
                debug!(room = %room_name, "Deleted empty room");
            }
        }
    }

    /// Publish an event to a room.
    ///
    /// Returns the number of members that received it.
    pub fn publish(&self, room_name: &str, event: &str, data: Option<Value>) -> usize {
        match self.rooms.get(room_name) {
            Some(room) => {
                let count = room.publish(Broadcast::new(room_name, event, data));
                trace!(room = %room_name, event = %event, recipients = count, "Published");
                count
            }
            None => {
                trace!(room = %room_name, event = %event, "Publish to room without members");
                0
            }
        }
    }

    #[must_use]
    pub fn room_exists(&self, room_name: &str) -> bool {
        self.rooms.contains_key(room_name)
    }

    #[must_use]
    pub fn member_count(&self, room_name: &str) -> usize {
        self.rooms
            .get(room_name)
            .map(|r| r.member_count())
            .unwrap_or(0)
    }

    /// Rooms a connection is in.
    #[must_use]
    pub fn rooms_of(&self, connection_id: &ConnectionId) -> Vec<String> {
        self.members
            .get(connection_id)
            .map(|m| m.forwards.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            room_count: self.rooms.len(),
            connection_count: self.members.len(),
            total_memberships: self.members.iter().map(|m| m.forwards.len()).sum(),
        }
    }
}

impl Default for RoomTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway for RoomTable {
    fn join_room(&self, connection_id: &ConnectionId, room: &str) {
        if let Err(e) = self.join(connection_id, room) {
            warn!(connection = %connection_id, room = %room, error = %e, "Join failed");
        }
    }

    fn leave_room(&self, connection_id: &ConnectionId, room: &str) {
        if let Err(e) = self.leave(connection_id, room) {
            debug!(connection = %connection_id, room = %room, error = %e, "Leave ignored");
        }
    }

    fn broadcast_to_room(&self, room: &str, event: &str, data: Option<Value>) -> usize {
        self.publish(room, event, data)
    }
}

/// Room table statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStats {
    pub room_count: usize,
    pub connection_count: usize,
    pub total_memberships: usize,
}

async fn forward(
    mut rx: broadcast::Receiver<Arc<Broadcast>>,
    outbox: mpsc::UnboundedSender<Arc<Broadcast>>,
    connection_id: ConnectionId,
    room_name: String,
) {
    loop {
        match rx.recv().await {
            Ok(msg) => {
                if outbox.send(msg).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(connection = %connection_id, room = %room_name, skipped, "Connection lagging, broadcasts dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
