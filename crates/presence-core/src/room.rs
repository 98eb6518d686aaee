//! A single gateway room.
//!
//! Rooms are named groups of connections sharing one broadcast channel.

use crate::gateway::ConnectionId;
use crate::message::Broadcast;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Maximum room name length in bytes.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Default broadcast channel capacity.
const DEFAULT_ROOM_CAPACITY: usize = 1024;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// A room and its members.
#[derive(Debug)]
pub struct Room {
    name: String,
    sender: broadcast::Sender<Arc<Broadcast>>,
    members: HashSet<ConnectionId>,
}

impl Room {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_ROOM_CAPACITY)
    }

    /// Create a room whose broadcast channel buffers `capacity` messages
    /// per lagging member.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            members: HashSet::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains(connection_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add a member, returning a receiver for the room's messages.
    pub fn join(&mut self, connection_id: ConnectionId) -> broadcast::Receiver<Arc<Broadcast>> {
        debug!(room = %self.name, connection = %connection_id, "Joined room");
        self.members.insert(connection_id);
        self.sender.subscribe()
    }

    /// Remove a member.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.members.remove(connection_id);
        if removed {
            debug!(room = %self.name, connection = %connection_id, "Left room");
        }
        removed
    }

    /// Publish a message to the room.
    ///
    /// Returns the number of receivers that got the message.
    pub fn publish(&self, message: Broadcast) -> usize {
        trace!(room = %self.name, event = %message.event, "Publishing to room");
        self.sender.send(Arc::new(message)).unwrap_or_default()
    }
}
