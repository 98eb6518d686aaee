//! # presence-protocol
//!
//! Wire protocol for relaying presence events through the stream-processing mesh.
//!
//! This crate defines the canonical presence event, its kind-specific
//! payloads, the framing used on mesh streams, and protocol versioning.
//!
//! ## Event Kinds
//!
//! - `online` / `offline` - A user joined or left a room
//! - `movement` / `sync` - Position updates and full state re-announcements
//! - `ding` / `latency` - Liveness and latency probes
//!
//! ## Example
//!
//! ```rust
//! use presence_protocol::{codec, Position, PresenceEvent};
//!
//! let event = PresenceEvent::movement("lobby", 1_700_000_000_000, "alice", Position::new(1.0, 0.0));
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod event;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, CodecError};
pub use event::{
    EventKind, MovementPayload, OfflinePayload, OnlinePayload, Payload, Position, PresenceEvent,
    ProbePayload, SyncPayload,
};
pub use frames::{credential, Handshake, Role};
pub use version::{Version, PROTOCOL_VERSION};
