//! Per-room fan-out of encoded frames.
//!
//! Every room gets one tokio broadcast channel. A frame sent by one peer is
//! delivered to every subscriber; receivers drop frames carrying their own
//! peer id. Lagging receivers lose the oldest frames (backpressure), which
//! the sync handshake repairs on the next reconnect.
//!
//! Used by both the WebSocket relay and the in-process transport hub.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::comment::RoomId;
use crate::error::TransportError;
use crate::protocol::SyncMessage;

/// An encoded [`SyncMessage`], shared between receivers.
pub type Frame = Arc<Vec<u8>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    max_peers: usize,
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it starts lagging.
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            max_peers,
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, peer_id: Uuid) -> Result<broadcast::Receiver<Frame>, TransportError> {
        let mut peers = self.peers.write().await;
        if !peers.contains(&peer_id) && peers.len() >= self.max_peers {
            return Err(TransportError::ConnectFailed(format!(
                "room is full ({} peers)",
                self.max_peers
            )));
        }
        peers.insert(peer_id);
        Ok(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and broadcast. Returns the number of receivers reached.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, TransportError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a receiver reported as lost.
    pub fn record_lag(&self, skipped: u64) {
        self.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room ids to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>,
    capacity: usize,
    max_peers: usize,
}

impl RoomManager {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
        }
    }

    /// Get or create the group for a room.
    pub async fn get_or_create(&self, room_id: &RoomId) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.capacity, self.max_peers)))
            .clone()
    }

    pub async fn get(&self, room_id: &RoomId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Remove a room once its last peer left.
    pub async fn remove_if_empty(&self, room_id: &RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.peer_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
