//! Binary frames exchanged between peers of a room.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┐
//! │ msg_type │ peer_id   │ room_id      │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + utf-8  │ variable │
//! └──────────┴───────────┴──────────────┴──────────┘
//! ```
//!
//! | Type | Payload |
//! |------|---------|
//! | `SyncStep1` | sender's Yrs state vector |
//! | `SyncStep2` | Yrs diff against the receiver's state vector |
//! | `Update` | incremental Yrs update (one appended comment) |
//! | `Awareness` | bincode [`AwarenessMessage`] |
//! | `PeerJoined` / `PeerLeft` | empty |
//! | `Ping` / `Pong` | empty |

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::comment::RoomId;
use crate::error::TransportError;
use crate::presence::AwarenessMessage;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector for the initial sync handshake
    SyncStep1 = 1,
    /// Yrs state diff response
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Presence / typing update
    Awareness = 4,
    /// Peer joined notification (also the relay join frame)
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room_id: RoomId,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room_id: &RoomId, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room_id: room_id.clone(),
            payload,
        }
    }

    pub fn sync_step1(peer_id: Uuid, room_id: &RoomId, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room_id, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, room_id: &RoomId, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room_id, state_diff)
    }

    pub fn update(peer_id: Uuid, room_id: &RoomId, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, room_id, yrs_update)
    }

    pub fn awareness(
        peer_id: Uuid,
        room_id: &RoomId,
        msg: &AwarenessMessage,
    ) -> Result<Self, TransportError> {
        let payload = msg.encode().map_err(TransportError::Protocol)?;
        Ok(Self::new(MessageType::Awareness, peer_id, room_id, payload))
    }

    pub fn peer_joined(peer_id: Uuid, room_id: &RoomId) -> Self {
        Self::new(MessageType::PeerJoined, peer_id, room_id, Vec::new())
    }

    pub fn peer_left(peer_id: Uuid, room_id: &RoomId) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room_id, Vec::new())
    }

    pub fn ping(peer_id: Uuid, room_id: &RoomId) -> Self {
        Self::new(MessageType::Ping, peer_id, room_id, Vec::new())
    }

    pub fn pong(peer_id: Uuid, room_id: &RoomId) -> Self {
        Self::new(MessageType::Pong, peer_id, room_id, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, TransportError> {
        if self.msg_type != MessageType::Awareness {
            return Err(TransportError::Protocol(format!(
                "expected Awareness, got {:?}",
                self.msg_type
            )));
        }
        AwarenessMessage::decode(&self.payload).map_err(TransportError::Protocol)
    }
}
