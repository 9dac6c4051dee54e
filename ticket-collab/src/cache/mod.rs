//! Local durable cache of room documents.
//!
//! ```text
//! ┌─────────────┐  persist(state)   ┌──────────────────────────────┐
//! │ RoomSession │ ────────────────► │ LocalCache                   │
//! │ (CommentDoc)│ ◄──────────────── │  RocksCache: CF "rooms"      │
//! └─────────────┘  load() at start  │              CF "metadata"   │
//!                                   │  MemoryCache: HashMap        │
//!                                   └──────────────────────────────┘
//! ```
//!
//! The persisted value is the full Yrs state of the room, so a restart
//! reproduces the comment list without any network. Writes happen after
//! every local append and every merge, before observers are notified.
//! Failures are logged by the caller and never block the merge.

pub mod memory;
pub mod rocks;

use crate::comment::RoomId;
use crate::error::CacheError;

pub use memory::MemoryCache;
pub use rocks::{CacheMetadata, RocksCache};

/// Durable per-room snapshot storage.
pub trait LocalCache: Send + Sync {
    /// Last persisted state, if any.
    fn load(&self, room_id: &RoomId) -> Result<Option<Vec<u8>>, CacheError>;

    /// Replace the persisted state.
    fn persist(&self, room_id: &RoomId, state: &[u8]) -> Result<(), CacheError>;

    fn remove(&self, room_id: &RoomId) -> Result<(), CacheError>;
}
