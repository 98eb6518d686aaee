//! # presence-core
//!
//! Session tracking and event relay for the presence relay.
//!
//! - **Session** - Per-connection identity and metadata
//! - **Dispatcher** - Client events to canonical mesh frames
//! - **Processor** - Mesh frames back out to local rooms
//! - **Rooms** - In-process room membership and broadcast
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Client    │────▶│ Dispatcher  │────▶│ Mesh (out)  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                                       │
//!        │                                       ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Rooms     │◀────│  Processor  │◀────│  Mesh (in)  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```

pub mod broadcaster;
pub mod context;
pub mod dispatcher;
pub mod gateway;
pub mod message;
pub mod processor;
pub mod room;
pub mod rooms;
pub mod session;

#[cfg(test)]
mod testing;

pub use broadcaster::RoomBroadcaster;
pub use context::{now_millis, RelayConfig, RelayContext, DEFAULT_COUNTRY, DEFAULT_ROOM};
pub use dispatcher::{DropReason, Outcome, RelayDispatcher};
pub use gateway::{ConnectionId, EventError, Gateway, GatewayEvent};
pub use message::Broadcast;
pub use processor::{FeedSummary, InboundProcessor};
pub use room::Room;
pub use rooms::{RoomConfig, RoomError, RoomStats, RoomTable};
pub use session::{Identity, Session, SessionError, SessionRegistry};
