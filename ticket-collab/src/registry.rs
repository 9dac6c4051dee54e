//! Process-wide room registry.
//!
//! Maps room ids to their shared [`RoomSession`] with a reference count per
//! room. The map and the counts sit behind one mutex, so concurrent
//! `acquire`/`release` for the same room can never build a second session or
//! tear one down while a handle is still live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::comment::RoomId;
use crate::presence::LocalIdentity;
use crate::session::{RoomSession, SessionDeps};

struct Entry {
    session: Arc<RoomSession>,
    ref_count: usize,
}

struct Inner {
    deps: SessionDeps,
    rooms: Mutex<HashMap<RoomId, Entry>>,
}

/// Owned registry of live rooms. Clones share the same map.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<Inner>,
}

impl RoomRegistry {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                rooms: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomId, Entry>> {
        self.inner
            .rooms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join a room, creating its session on first use.
    ///
    /// The first acquire of a room uses `identity`; later ones share the
    /// existing session and its identity. Must be called inside a tokio
    /// runtime.
    pub fn acquire(&self, room_id: RoomId, identity: LocalIdentity) -> RoomHandle {
        let mut rooms = self.rooms();
        let entry = rooms.entry(room_id.clone()).or_insert_with(|| {
            log::info!("Opening room {room_id}");
            Entry {
                session: RoomSession::start(room_id.clone(), identity, self.inner.deps.clone()),
                ref_count: 0,
            }
        });
        entry.ref_count += 1;
        log::debug!("Acquired room {room_id} (refs: {})", entry.ref_count);

        RoomHandle {
            session: entry.session.clone(),
            registry: self.clone(),
        }
    }

    /// Give a handle back. Same as dropping it.
    pub fn release(&self, handle: RoomHandle) {
        drop(handle);
    }

    fn release_room(&self, session: &Arc<RoomSession>) {
        let room_id = session.room_id();
        let finished = {
            let mut rooms = self.rooms();
            let Some(entry) = rooms.get_mut(room_id) else {
                log::warn!("Release of unknown room {room_id}");
                return;
            };
            if !Arc::ptr_eq(&entry.session, session) {
                log::warn!("Release of a stale session for room {room_id}");
                return;
            }
            entry.ref_count -= 1;
            log::debug!("Released room {room_id} (refs: {})", entry.ref_count);
            if entry.ref_count > 0 {
                return;
            }
            rooms.remove(room_id).map(|entry| entry.session)
        };

        if let Some(session) = finished {
            // Teardown is synchronous and never calls back into the registry.
            session.teardown();
            log::info!("Closed room {room_id}");
        }
    }

    pub fn ref_count(&self, room_id: &RoomId) -> usize {
        self.rooms().get(room_id).map_or(0, |entry| entry.ref_count)
    }

    pub fn room_count(&self) -> usize {
        self.rooms().len()
    }

    pub fn active_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.rooms().keys().cloned().collect();
        rooms.sort();
        rooms
    }
}

/// A consumer's share of a room. Dropping it releases the share.
pub struct RoomHandle {
    session: Arc<RoomSession>,
    registry: RoomRegistry,
}

impl RoomHandle {
    pub fn session(&self) -> &Arc<RoomSession> {
        &self.session
    }

    pub fn room_id(&self) -> &RoomId {
        self.session.room_id()
    }
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", self.session.room_id())
            .finish()
    }
}

impl Drop for RoomHandle {
    fn drop(&mut self) {
        self.registry.release_room(&self.session);
    }
}
