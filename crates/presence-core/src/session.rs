//! Per-connection session state.
//!
//! A session is created empty when a connection opens, identified by the
//! first `online` event, read by every later event, and removed when the
//! connection closes.

use crate::gateway::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error};

/// Session registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// A session already exists for the connection.
    #[error("Duplicate session: {0}")]
    DuplicateSession(ConnectionId),

    /// No session exists for the connection.
    #[error("Session not found: {0}")]
    NotFound(ConnectionId),

    /// The session exists but has not sent `online` yet.
    #[error("Session not identified: {0}")]
    Unidentified(ConnectionId),

    /// The connection tried to change its user id.
    #[error("Connection {connection} is already identified as {current}")]
    IdentityConflict {
        connection: ConnectionId,
        current: String,
    },
}

/// Who a connection is, fixed by its first `online` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub room_id: String,
}

/// Session state for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Connection identity issued by the gateway.
    pub connection_id: ConnectionId,
    /// Set by the first `online` event.
    pub identity: Option<Identity>,
    /// Last-known country code.
    pub country: Option<String>,
    /// Last-known avatar reference.
    pub avatar: Option<String>,
    /// When the connection opened, milliseconds since the Unix epoch.
    pub connected_at: u64,
}

impl Session {
    /// Create an empty session.
    #[must_use]
    pub fn new(connection_id: ConnectionId) -> Self {
        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            connection_id,
            identity: None,
            country: None,
            avatar: None,
            connected_at,
        }
    }

    /// Whether the session has been identified.
    #[must_use]
    pub fn is_identified(&self) -> bool {
        self.identity.is_some()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.user_id.as_str())
    }

    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.room_id.as_str())
    }
}

/// What [`SessionRegistry::set_identity`] changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityChange {
    /// The session was empty and is now identified.
    New,
    /// Same user and room as before.
    Unchanged,
    /// Same user, different room.
    RoomChanged { previous: String },
}

/// Registry of sessions keyed by connection identity.
///
/// Every read and write of a given connection goes through the map's lock
/// for that key, so concurrent connection workers see a consistent view.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions that have sent `online`.
    #[must_use]
    pub fn identified_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_identified()).count()
    }

    /// Insert an empty session.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateSession` if one already exists; the existing
    /// session is left untouched.
    pub fn create(&self, connection_id: &ConnectionId) -> Result<Session, SessionError> {
        match self.sessions.entry(connection_id.clone()) {
            Entry::Occupied(_) => {
                error!(connection = %connection_id, "Duplicate session rejected");
                Err(SessionError::DuplicateSession(connection_id.clone()))
            }
            Entry::Vacant(entry) => {
                let session = Session::new(connection_id.clone());
                entry.insert(session.clone());
                debug!(connection = %connection_id, "Session created");
                Ok(session)
            }
        }
    }

    /// Identify a session.
    ///
    /// Calling again with the same user id is allowed; country and avatar
    /// are last-write-wins and the room follows the latest call.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session does not exist, or
    /// `IdentityConflict` if it is already identified as another user.
    pub fn set_identity(
        &self,
        connection_id: &ConnectionId,
        user_id: &str,
        room_id: &str,
        country: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<IdentityChange, SessionError> {
        let mut entry = self
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| SessionError::NotFound(connection_id.clone()))?;
        let session: &mut Session = &mut entry;

        let change = match session.identity.as_ref() {
            None => IdentityChange::New,
            Some(identity) if identity.user_id != user_id => {
                return Err(SessionError::IdentityConflict {
                    connection: connection_id.clone(),
                    current: identity.user_id.clone(),
                });
            }
            Some(identity) if identity.room_id == room_id => IdentityChange::Unchanged,
            Some(identity) => IdentityChange::RoomChanged {
                previous: identity.room_id.clone(),
            },
        };

        session.identity = Some(Identity {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
        });
        if let Some(country) = country {
            session.country = Some(country.to_string());
        }
        if let Some(avatar) = avatar {
            session.avatar = Some(avatar.to_string());
        }

        debug!(connection = %connection_id, user = %user_id, room = %room_id, ?change, "Session identified");
        Ok(change)
    }

    /// Update display metadata, last-write-wins.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session does not exist.
    pub fn update_metadata(
        &self,
        connection_id: &ConnectionId,
        country: Option<&str>,
        avatar: Option<&str>,
    ) -> Result<(), SessionError> {
        let mut session = self
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| SessionError::NotFound(connection_id.clone()))?;

        if let Some(country) = country {
            session.country = Some(country.to_string());
        }
        if let Some(avatar) = avatar {
            session.avatar = Some(avatar.to_string());
        }
        Ok(())
    }

    /// Get a snapshot of a session.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session does not exist.
    pub fn get(&self, connection_id: &ConnectionId) -> Result<Session, SessionError> {
        self.sessions
            .get(connection_id)
            .map(|s| s.clone())
            .ok_or_else(|| SessionError::NotFound(connection_id.clone()))
    }

    /// Get a session together with its identity.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session does not exist, or `Unidentified`
    /// if it has not sent `online` yet.
    pub fn identified(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<(Identity, Session), SessionError> {
        let session = self.get(connection_id)?;
        match session.identity.clone() {
            Some(identity) => Ok((identity, session)),
            None => Err(SessionError::Unidentified(connection_id.clone())),
        }
    }

    /// Remove a session, returning its last state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session does not exist.
    pub fn remove(&self, connection_id: &ConnectionId) -> Result<Session, SessionError> {
        let (_, session) = self
            .sessions
            .remove(connection_id)
            .ok_or_else(|| SessionError::NotFound(connection_id.clone()))?;
        debug!(connection = %connection_id, "Session removed");
        Ok(session)
    }
}
