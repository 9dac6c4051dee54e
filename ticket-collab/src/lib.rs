//! # ticket-collab: Real-time collaborative ticket comments
//!
//! Several viewers of one ticket append comments concurrently, see each
//! other's presence and typing state, keep working offline, and converge on
//! one comment history once connectivity returns. A canonical store stays the
//! system of record for clients that never join a live room.
//!
//! ## Architecture
//!
//! ```text
//!   UI ──► CommentThread ──► RoomRegistry ──► RoomSession (one per ticket)
//!                                              │
//!          ┌──────────────┬───────────────────┼──────────────────┐
//!          ▼              ▼                   ▼                  ▼
//!     CommentDoc     PresenceState    ConnectionManager   PendingWriteQueue
//!     (Yrs log)      (awareness)      (backoff FSM)       (retry buffer)
//!          │                                  │                  │
//!          ▼                                  ▼                  ▼
//!     LocalCache                        PeerTransport      CanonicalStore
//!     (RocksDB)                    (memory hub / relay)     (external)
//! ```
//!
//! ## Modules
//!
//! - [`document`]: Append-only comment log on a Yrs map, deterministic order
//! - [`presence`]: Ephemeral active-user and typing state
//! - [`connection`]: Connection state machine with exponential backoff
//! - [`cache`]: Write-through local persistence (RocksDB + LZ4)
//! - [`reconcile`]: Canonical-store history load and pending-write queue
//! - [`session`]: Per-room driver tying the above together
//! - [`registry`]: Reference-counted room sessions
//! - [`thread`]: Consumer facade
//! - [`protocol`], [`transport`], [`broadcast`], [`relay`]: Peer sync wire
//!   format, transports and the WebSocket rendezvous relay
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Convergence | Grow-only Yrs map keyed by comment id, sorted by `(created_at, id)` |
//! | Idempotent merge | Yrs skips known blocks; history merge skips known ids |
//! | Offline durability | Write-through cache + pending-write retries |
//! | Canonical delivery | At-least-once, idempotent append on id |

pub mod broadcast;
pub mod cache;
pub mod comment;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod relay;
pub mod session;
pub mod thread;
pub mod transport;

// Re-exports for convenience
pub use cache::{LocalCache, MemoryCache, RocksCache};
pub use comment::{Author, Comment, RoomId, MAX_COMMENT_LEN};
pub use config::{BackoffConfig, CacheConfig, RelayConfig, SessionConfig};
pub use connection::{ConnectionAction, ConnectionEvent, ConnectionManager, ConnectionStatus};
pub use document::{ChangeOrigin, CommentDoc, DocChange, ObserverToken};
pub use error::{
    CacheError, CollabError, DocError, StoreError, TransportError, ValidationError,
};
pub use presence::{ActiveUser, AwarenessMessage, LocalIdentity, PresenceState};
pub use protocol::{MessageType, SyncMessage};
pub use reconcile::{CanonicalStore, MemoryStore, PendingWrite, PendingWriteQueue};
pub use registry::{RoomHandle, RoomRegistry};
pub use relay::{RelayServer, RelayStats};
pub use session::{RoomSession, SessionDeps, SessionEvent};
pub use thread::CommentThread;
pub use transport::{MemoryTransport, PeerLink, PeerTransport, WsTransport};
