//! WebSocket rendezvous relay.
//!
//! ```text
//! Peer A ──┐                               ┌──► Peer B
//!          ├── ws ── RelayServer ── Room ──┤
//! Peer C ──┘         (room_id)             └──► Peer C
//! ```
//!
//! The relay holds no document state. It routes frames:
//!
//! | Frame | Action |
//! |-------|--------|
//! | first `PeerJoined` | join the room named in the frame, announce to others |
//! | `Ping` | answered with `Pong` to the sender only |
//! | anything else | fanned out to the other peers of the room |
//! | socket closed | `PeerLeft` fanned out, empty room removed |
//!
//! Sync handshakes happen end to end between peers.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame, RoomManager};
use crate::comment::RoomId;
use crate::config::RelayConfig;
use crate::protocol::{MessageType, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
}

/// The rendezvous server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership: Option<(Uuid, RoomId, Arc<BroadcastGroup>)> = None;
        let mut room_rx: Option<broadcast::Receiver<Frame>> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let sync_msg = match SyncMessage::decode(&data) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                {
                                    let mut s = stats.write().await;
                                    s.total_frames += 1;
                                    s.total_bytes += data.len() as u64;
                                }

                                if membership.is_none() {
                                    if sync_msg.msg_type != MessageType::PeerJoined {
                                        log::warn!("Frame {:?} from {addr} before join", sync_msg.msg_type);
                                        continue;
                                    }
                                    let group = rooms.get_or_create(&sync_msg.room_id).await;
                                    let rx = match group.add_peer(sync_msg.peer_id).await {
                                        Ok(rx) => rx,
                                        Err(e) => {
                                            log::warn!("Rejecting {addr}: {e}");
                                            rooms.remove_if_empty(&sync_msg.room_id).await;
                                            let _ = ws_sender.send(Message::Close(None)).await;
                                            return Ok(());
                                        }
                                    };
                                    group.broadcast_raw(Arc::new(data.to_vec()));
                                    log::info!("Peer {} joined room {}", sync_msg.peer_id, sync_msg.room_id);
                                    room_rx = Some(rx);
                                    membership = Some((sync_msg.peer_id, sync_msg.room_id, group));
                                    continue;
                                }
                                let Some((peer_id, room_id, group)) = &membership else {
                                    continue;
                                };

                                if sync_msg.msg_type == MessageType::Ping {
                                    let pong = SyncMessage::pong(Uuid::nil(), room_id).encode()?;
                                    ws_sender.send(Message::Binary(pong.into())).await?;
                                } else if sync_msg.peer_id != *peer_id || sync_msg.room_id != *room_id {
                                    log::warn!("Dropping spoofed frame from {addr}");
                                } else {
                                    group.broadcast_raw(Arc::new(data.to_vec()));
                                }
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    frame = async {
                        match room_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            // No room yet: wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(frame) => {
                                // Don't echo back to sender
                                if let (Ok(sync_msg), Some((peer_id, _, _))) =
                                    (SyncMessage::decode(&frame), &membership)
                                {
                                    if sync_msg.peer_id == *peer_id {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                if let Some((peer_id, _, group)) = &membership {
                                    group.record_lag(n);
                                    log::warn!("Peer {peer_id} lagged by {n} frames");
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some((peer_id, room_id, group)) = membership {
            group.remove_peer(&peer_id).await;
            let _ = group.broadcast(&SyncMessage::peer_left(peer_id, &room_id));
            if rooms.remove_if_empty(&room_id).await {
                log::info!("Room {room_id} removed (empty)");
            }
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_creation() {
        let relay = RelayServer::new(RelayConfig::default());
        assert_eq!(relay.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = RelayServer::new(RelayConfig::default());
        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(relay.room_count().await, 0);
    }
}
