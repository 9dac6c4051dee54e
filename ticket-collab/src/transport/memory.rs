//! In-process transport: every room is a [`BroadcastGroup`] inside a shared
//! hub. Frames still go through the binary codec so the path matches the
//! relay.
//!
//! The hub can be made unreachable and can sever every live link, which is
//! how tests simulate partitions and rendezvous outages.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use super::{PeerLink, PeerTransport, LINK_CAPACITY};
use crate::broadcast::{BroadcastGroup, Frame, RoomManager};
use crate::comment::RoomId;
use crate::error::TransportError;
use crate::protocol::{MessageType, SyncMessage};

struct Hub {
    rooms: RoomManager,
    reachable: AtomicBool,
    /// Bumped to cut every live link.
    sever_tx: watch::Sender<u64>,
    join_attempts: AtomicUsize,
}

/// Shared in-process rendezvous. Clones talk to the same hub.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (sever_tx, _) = watch::channel(0);
        Self {
            hub: Arc::new(Hub {
                rooms: RoomManager::new(LINK_CAPACITY, usize::MAX),
                reachable: AtomicBool::new(true),
                sever_tx,
                join_attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Toggle reachability. Going unreachable also severs live links.
    pub fn set_reachable(&self, reachable: bool) {
        self.hub.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.sever_all();
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.hub.reachable.load(Ordering::SeqCst)
    }

    /// Drop every live link; peers see their inbound channel close.
    pub fn sever_all(&self) {
        self.hub.sever_tx.send_modify(|epoch| *epoch += 1);
    }

    /// Number of `join` calls so far, successful or not.
    pub fn join_attempts(&self) -> usize {
        self.hub.join_attempts.load(Ordering::SeqCst)
    }

    pub async fn peer_count(&self, room_id: &RoomId) -> usize {
        match self.hub.rooms.get(room_id).await {
            Some(group) => group.peer_count().await,
            None => 0,
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTransport for MemoryTransport {
    fn join(
        &self,
        room_id: &RoomId,
        peer_id: Uuid,
    ) -> BoxFuture<'static, Result<PeerLink, TransportError>> {
        let hub = self.hub.clone();
        let room_id = room_id.clone();
        Box::pin(async move {
            hub.join_attempts.fetch_add(1, Ordering::SeqCst);
            if !hub.reachable.load(Ordering::SeqCst) {
                return Err(TransportError::Unreachable);
            }

            let group = hub.rooms.get_or_create(&room_id).await;
            let room_rx = group.add_peer(peer_id).await?;
            let sever_rx = hub.sever_tx.subscribe();

            let (out_tx, out_rx) = mpsc::channel(LINK_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);

            if let Err(e) = group.broadcast(&SyncMessage::peer_joined(peer_id, &room_id)) {
                log::warn!("Failed to announce peer {peer_id} in room {room_id}: {e}");
            }
            log::debug!("Peer {peer_id} joined in-process room {room_id}");

            let pump = LinkPump {
                hub,
                group,
                room_id,
                peer_id,
            };
            tokio::spawn(pump.run(out_rx, room_rx, in_tx, sever_rx));

            Ok(PeerLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

/// Moves frames between one peer's link and its room group.
struct LinkPump {
    hub: Arc<Hub>,
    group: Arc<BroadcastGroup>,
    room_id: RoomId,
    peer_id: Uuid,
}

impl LinkPump {
    async fn run(
        self,
        mut out_rx: mpsc::Receiver<SyncMessage>,
        mut room_rx: broadcast::Receiver<Frame>,
        in_tx: mpsc::Sender<SyncMessage>,
        mut sever_rx: watch::Receiver<u64>,
    ) {
        loop {
            tokio::select! {
                _ = sever_rx.changed() => {
                    log::debug!("Link of peer {} severed", self.peer_id);
                    break;
                }

                msg = out_rx.recv() => match msg {
                    Some(msg) if msg.msg_type == MessageType::Ping => {
                        if in_tx.send(SyncMessage::pong(Uuid::nil(), &self.room_id)).await.is_err() {
                            break;
                        }
                    }
                    Some(msg) => {
                        if let Err(e) = self.group.broadcast(&msg) {
                            log::warn!("Dropping frame from {}: {e}", self.peer_id);
                        }
                    }
                    // Link dropped by its owner
                    None => break,
                },

                frame = room_rx.recv() => match frame {
                    Ok(frame) => match SyncMessage::decode(&frame) {
                        Ok(msg) if msg.peer_id == self.peer_id => {}
                        Ok(msg) => {
                            if in_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame in room {}: {e}", self.room_id),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.group.record_lag(n);
                        log::warn!("Peer {} lagged by {n} frames", self.peer_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        self.group.remove_peer(&self.peer_id).await;
        let _ = self
            .group
            .broadcast(&SyncMessage::peer_left(self.peer_id, &self.room_id));
        self.hub.rooms.remove_if_empty(&self.room_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_non_membership(link: &mut PeerLink) -> SyncMessage {
        loop {
            let msg = timeout(Duration::from_secs(1), link.inbound.recv())
                .await
                .expect("timed out")
                .expect("link closed");
            if !matches!(msg.msg_type, MessageType::PeerJoined | MessageType::PeerLeft) {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_frames_reach_other_peers_only() {
        let transport = MemoryTransport::new();
        let room = RoomId::new("T-1");
        let alice = Uuid::new_v4();
        let mut a = transport.join(&room, alice).await.unwrap();
        let mut b = transport.join(&room, Uuid::new_v4()).await.unwrap();

        a.outbound
            .send(SyncMessage::update(alice, &room, vec![7]))
            .await
            .unwrap();

        let got = next_non_membership(&mut b).await;
        assert_eq!(got.peer_id, alice);
        assert_eq!(got.payload, vec![7]);

        // Alice never sees her own frame
        assert!(timeout(Duration::from_millis(50), next_non_membership(&mut a))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let transport = MemoryTransport::new();
        let alice = Uuid::new_v4();
        let a = transport.join(&RoomId::new("T-1"), alice).await.unwrap();
        let mut b = transport.join(&RoomId::new("T-2"), Uuid::new_v4()).await.unwrap();

        a.outbound
            .send(SyncMessage::update(alice, &RoomId::new("T-1"), vec![1]))
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(50), next_non_membership(&mut b))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let transport = MemoryTransport::new();
        let room = RoomId::new("T-1");
        let peer = Uuid::new_v4();
        let mut link = transport.join(&room, peer).await.unwrap();

        link.outbound.send(SyncMessage::ping(peer, &room)).await.unwrap();
        let pong = next_non_membership(&mut link).await;
        assert_eq!(pong.msg_type, MessageType::Pong);
    }

    #[tokio::test]
    async fn test_unreachable_rejects_join() {
        let transport = MemoryTransport::new();
        transport.set_reachable(false);
        let result = transport.join(&RoomId::new("T-1"), Uuid::new_v4()).await;
        assert!(matches!(result, Err(TransportError::Unreachable)));
        assert_eq!(transport.join_attempts(), 1);
    }

    #[tokio::test]
    async fn test_sever_closes_inbound() {
        let transport = MemoryTransport::new();
        let room = RoomId::new("T-1");
        let mut link = transport.join(&room, Uuid::new_v4()).await.unwrap();
        assert_eq!(transport.peer_count(&room).await, 1);

        transport.sever_all();
        let closed = timeout(Duration::from_secs(1), async {
            while link.inbound.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_link_leaves_room() {
        let transport = MemoryTransport::new();
        let room = RoomId::new("T-1");
        let link = transport.join(&room, Uuid::new_v4()).await.unwrap();
        drop(link);

        timeout(Duration::from_secs(1), async {
            while transport.peer_count(&room).await > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("peer never left");
    }
}
