//! Binary protocol between lobby peers and the relay.
//!
//! Wire format (bincode-encoded, one binary WebSocket frame per message):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are opaque yrs v1 updates / state vectors for the sync messages,
//! a bincode [`AwarenessMessage`] for presence and a bincode [`PeerInfo`]
//! for joins.

use lobby_core::{LobbyError, PlayerColor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::AwarenessMessage;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asks the other side for what it is missing
    SyncStep1 = 1,
    /// Yrs diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental document update
    Update = 3,
    /// Presence packet
    Awareness = 4,
    /// A connection joined the room
    PeerJoined = 5,
    /// A connection left the room
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Connection identity announced on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    pub color: PlayerColor,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id; the color is stable for a given id.
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: PlayerColor::from_seed(peer_id.as_u128()),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Sender-local counter, increases with every update it sends
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_type(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    /// Incremental document update.
    pub fn update(peer_id: Uuid, room: &str, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::with_type(MessageType::Update, peer_id, room, clock, yrs_update)
    }

    /// Sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::with_type(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    /// Sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, room: &str, state_diff: Vec<u8>) -> Self {
        Self::with_type(MessageType::SyncStep2, peer_id, room, 0, state_diff)
    }

    /// Presence packet.
    pub fn awareness(
        peer_id: Uuid,
        room: &str,
        clock: u64,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::with_type(MessageType::Awareness, peer_id, room, clock, message.encode()?))
    }

    /// Peer joined notification.
    pub fn peer_joined(peer_id: Uuid, room: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::with_type(MessageType::PeerJoined, peer_id, room, 0, payload))
    }

    /// Peer left notification.
    pub fn peer_left(peer_id: Uuid, room: &str) -> Self {
        Self::with_type(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::with_type(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::with_type(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the presence payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessMessage::decode(&self.payload)
    }

    /// Parse the peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Room {0} is full")]
    RoomFull(String),
    #[error(transparent)]
    Document(#[from] LobbyError),
}
