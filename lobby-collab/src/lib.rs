//! # lobby-collab: Networking for the duel lobby
//!
//! Connects [`lobby_core::Lobby`] instances through a WebSocket relay and
//! carries the ephemeral presence of every connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ LobbyPeer   │ ◄────────────────► │ RelayServer │
//! │ SyncClient  │    Binary Proto    │ (relay)     │
//! └──────┬──────┘                    └──────┬──────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌─────────────┐
//! │ Lobby (yrs) │                    │ Room (yrs)  │
//! │ Presence    │                    │ Broadcast   │
//! └─────────────┘                    └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`broadcast`]: rooms and their fan-out
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket client with offline queue
//! - [`presence`]: presence records, throttle and manager
//! - [`peer`]: registry + presence + client event loop

pub mod broadcast;
pub mod client;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod server;

pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Room, RoomManager, Subscription};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use peer::{LobbyPeer, PeerConfig, DEFAULT_ROOM};
pub use presence::{
    scale_to_viewport, AwarenessMessage, PresenceField, PresenceManager, PresenceRecord, Throttle,
    Vec2, ViewportSize, PRESENCE_THROTTLE,
};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use server::{RelayServer, ServerConfig, ServerStats, DEFAULT_HOST, DEFAULT_PORT};
