//! Relay integration tests over real WebSockets.
//!
//! These tests start a real relay on a free port and connect real peers,
//! verifying the full wire path.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use ticket_collab::{
    Author, CommentThread, ConnectionStatus, LocalIdentity, MemoryCache, MemoryStore, MessageType,
    RelayConfig, RelayServer, RoomId, RoomRegistry, SessionConfig, SessionDeps, SyncMessage,
    WsTransport,
};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a relay on a free port, return it with its URL.
async fn start_test_relay() -> (Arc<RelayServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = Arc::new(RelayServer::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        max_peers_per_room: 10,
    }));
    let server = relay.clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (relay, format!("ws://127.0.0.1:{port}"))
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

type RawSocket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn raw_peer(url: &str, peer: Uuid, room: &RoomId) -> RawSocket {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    send(&mut ws, &SyncMessage::peer_joined(peer, room)).await;
    ws
}

async fn send(ws: &mut RawSocket, msg: &SyncMessage) {
    ws.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();
}

/// Next decoded frame, or None if nothing arrives in time.
async fn next_frame(ws: &mut RawSocket, wait: Duration) -> Option<SyncMessage> {
    loop {
        match timeout(wait, ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => return Some(SyncMessage::decode(&data).unwrap()),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn test_relay_fans_out_to_other_peers_only() {
    let (_relay, url) = start_test_relay().await;
    let room = RoomId::new("T-1");
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    let mut ws_a = raw_peer(&url, a, &room).await;
    let mut ws_b = raw_peer(&url, b, &room).await;

    // A is told about B joining
    let joined = next_frame(&mut ws_a, Duration::from_secs(2)).await.unwrap();
    assert_eq!(joined.msg_type, MessageType::PeerJoined);
    assert_eq!(joined.peer_id, b);

    send(&mut ws_a, &SyncMessage::update(a, &room, vec![1, 2, 3])).await;
    let got = next_frame(&mut ws_b, Duration::from_secs(2)).await.unwrap();
    assert_eq!(got.msg_type, MessageType::Update);
    assert_eq!(got.payload, vec![1, 2, 3]);

    // No echo to the sender
    assert!(next_frame(&mut ws_a, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_relay_isolates_rooms_and_answers_ping() {
    let (relay, url) = start_test_relay().await;
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let mut ws_a = raw_peer(&url, a, &RoomId::new("T-1")).await;
    let mut ws_b = raw_peer(&url, b, &RoomId::new("T-2")).await;

    send(&mut ws_a, &SyncMessage::update(a, &RoomId::new("T-1"), vec![9])).await;
    assert!(next_frame(&mut ws_b, Duration::from_millis(200)).await.is_none());

    send(&mut ws_b, &SyncMessage::ping(b, &RoomId::new("T-2"))).await;
    let pong = next_frame(&mut ws_b, Duration::from_secs(2)).await.unwrap();
    assert_eq!(pong.msg_type, MessageType::Pong);

    assert_eq!(relay.room_count().await, 2);
    assert_eq!(relay.stats().await.active_connections, 2);
}

#[tokio::test]
async fn test_relay_announces_departure() {
    let (relay, url) = start_test_relay().await;
    let room = RoomId::new("T-1");
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let mut ws_a = raw_peer(&url, a, &room).await;
    let mut ws_b = raw_peer(&url, b, &room).await;
    let _ = next_frame(&mut ws_a, Duration::from_secs(2)).await;

    ws_b.close(None).await.unwrap();
    let left = next_frame(&mut ws_a, Duration::from_secs(2)).await.unwrap();
    assert_eq!(left.msg_type, MessageType::PeerLeft);
    assert_eq!(left.peer_id, b);

    drop(ws_a);
    for _ in 0..100 {
        if relay.room_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.room_count().await, 0);
}

#[tokio::test]
async fn test_sessions_sync_through_relay() {
    let (_relay, url) = start_test_relay().await;
    let store = MemoryStore::new();
    let registry = |cache: MemoryCache| {
        RoomRegistry::new(SessionDeps {
            transport: Arc::new(WsTransport::new(url.clone())),
            cache: Arc::new(cache),
            store: Arc::new(store.clone()),
            config: SessionConfig::for_testing(),
        })
    };
    let reg_a = registry(MemoryCache::new());
    let reg_b = registry(MemoryCache::new());
    let room = RoomId::new("T-55");
    let alice = CommentThread::new(reg_a.acquire(room.clone(), LocalIdentity::new("u-1", "Alice")));
    let bob = CommentThread::new(reg_b.acquire(room.clone(), LocalIdentity::new("u-2", "Bob")));

    eventually("both connected", || {
        alice.connection_status() == ConnectionStatus::Connected
            && bob.connection_status() == ConnectionStatus::Connected
    })
    .await;

    let c = alice.add_comment("over the wire", &Author::new("u-1", "Alice")).unwrap();
    eventually("bob has it", || bob.comments().len() == 1).await;
    assert_eq!(bob.comments()[0], c);

    bob.set_typing_status(true).unwrap();
    eventually("alice sees bob typing", || alice.typing_users().contains("u-2")).await;
    eventually("both users listed", || alice.active_users().len() == 2).await;
}
