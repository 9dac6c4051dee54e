//! In-process cache with failure injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::LocalCache;
use crate::comment::RoomId;
use crate::error::CacheError;

/// `LocalCache` backed by a `HashMap`. Clones share storage, which lets a
/// test "restart" a process by building a new registry over the same cache.
#[derive(Clone, Default)]
pub struct MemoryCache {
    rooms: Arc<Mutex<HashMap<RoomId, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
    persist_count: Arc<AtomicUsize>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `persist` fail with `Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful `persist` calls so far.
    pub fn persist_count(&self) -> usize {
        self.persist_count.load(Ordering::SeqCst)
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms
            .lock()
            .map(|rooms| rooms.contains_key(room_id))
            .unwrap_or(false)
    }
}

impl LocalCache for MemoryCache {
    fn load(&self, room_id: &RoomId) -> Result<Option<Vec<u8>>, CacheError> {
        let rooms = self.rooms.lock().map_err(|_| CacheError::Unavailable)?;
        Ok(rooms.get(room_id).cloned())
    }

    fn persist(&self, room_id: &RoomId, state: &[u8]) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable);
        }
        let mut rooms = self.rooms.lock().map_err(|_| CacheError::Unavailable)?;
        rooms.insert(room_id.clone(), state.to_vec());
        self.persist_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, room_id: &RoomId) -> Result<(), CacheError> {
        let mut rooms = self.rooms.lock().map_err(|_| CacheError::Unavailable)?;
        rooms.remove(room_id);
        Ok(())
    }
}
