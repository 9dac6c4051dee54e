//! WebSocket transport to a [`RelayServer`](crate::relay::RelayServer).
//!
//! One connection per joined room. The first frame is `PeerJoined`, after
//! which a writer task forwards the outbound channel to the socket and a
//! reader task forwards decoded frames to the inbound channel.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{PeerLink, PeerTransport, LINK_CAPACITY};
use crate::comment::RoomId;
use crate::error::TransportError;
use crate::protocol::SyncMessage;

/// Connects to a relay at a `ws://` URL.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PeerTransport for WsTransport {
    fn join(
        &self,
        room_id: &RoomId,
        peer_id: Uuid,
    ) -> BoxFuture<'static, Result<PeerLink, TransportError>> {
        let url = self.url.clone();
        let room_id = room_id.clone();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let join = SyncMessage::peer_joined(peer_id, &room_id).encode()?;
            ws_writer
                .send(Message::Binary(join.into()))
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

            let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(LINK_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel::<SyncMessage>(LINK_CAPACITY);

            // Writer task: outbound channel → socket. Ends when the link is
            // dropped, closing the socket so the reader ends too.
            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    let encoded = match msg.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::warn!("Dropping unencodable frame: {e}");
                            continue;
                        }
                    };
                    if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.send(Message::Close(None)).await;
            });

            // Reader task: socket → inbound channel.
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                            Ok(sync_msg) => {
                                if sync_msg.peer_id == peer_id {
                                    continue;
                                }
                                if in_tx.send(sync_msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Undecodable frame from relay: {e}"),
                        },
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                log::debug!("Relay connection of peer {peer_id} closed");
            });

            log::info!("Peer {peer_id} connected to relay {url} for room {room_id}");
            Ok(PeerLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
