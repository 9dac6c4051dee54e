//! Peer transport abstraction.
//!
//! A session joins a room through a [`PeerTransport`] and gets back a
//! [`PeerLink`]: frames pushed into `outbound` reach every other peer of the
//! room, frames from those peers arrive on `inbound`.
//!
//! ```text
//!  RoomSession driver
//!    │  outbound (mpsc)            inbound (mpsc)  ▲
//!    ▼                                             │
//!  ┌──────────────────── pump task ────────────────┴┐
//!  │ MemoryTransport: BroadcastGroup in-process      │
//!  │ WsTransport:     WebSocket to the relay         │
//!  └─────────────────────────────────────────────────┘
//! ```
//!
//! Dropping the link disconnects. The inbound channel closing means the
//! transport was lost.

pub mod memory;
pub mod ws;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::comment::RoomId;
use crate::error::TransportError;
use crate::protocol::SyncMessage;

pub use memory::MemoryTransport;
pub use ws::WsTransport;

/// Frames buffered in each direction of a link.
pub const LINK_CAPACITY: usize = 256;

/// A live connection of one peer to one room.
pub struct PeerLink {
    pub outbound: mpsc::Sender<SyncMessage>,
    pub inbound: mpsc::Receiver<SyncMessage>,
}

/// Connects sessions to the peers of a room.
pub trait PeerTransport: Send + Sync {
    /// Join `room_id` as `peer_id`. The join frame is sent by the transport.
    fn join(
        &self,
        room_id: &RoomId,
        peer_id: Uuid,
    ) -> BoxFuture<'static, Result<PeerLink, TransportError>>;
}
