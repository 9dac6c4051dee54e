//! `CommentThread`: the consumer-facing API of one ticket's comment room.
//!
//! ```text
//!   UI ──► CommentThread ──► RoomSession (local apply, broadcast)
//!                │                 └──► canonical write (async, retried)
//!                └── provisional entries, superseded by id once the
//!                    log reports the comment
//! ```
//!
//! Every call returns immediately; durable confirmation arrives later as a
//! [`SessionEvent`] (or never needs to, when the write succeeds first time).

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::comment::{validate, Author, Comment, RoomId};
use crate::connection::ConnectionStatus;
use crate::document::ObserverToken;
use crate::error::CollabError;
use crate::presence::ActiveUser;
use crate::registry::RoomHandle;
use crate::session::SessionEvent;

type Provisional = Arc<Mutex<HashMap<Uuid, Comment>>>;

pub struct CommentThread {
    handle: RoomHandle,
    provisional: Provisional,
    token: ObserverToken,
}

impl CommentThread {
    pub fn new(handle: RoomHandle) -> Self {
        let provisional: Provisional = Arc::default();
        let pending = provisional.clone();
        let token = handle.session().observe(move |change| {
            if let Ok(mut pending) = pending.lock() {
                for id in &change.added {
                    pending.remove(id);
                }
            }
        });
        Self {
            handle,
            provisional,
            token,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        self.handle.room_id()
    }

    /// Validate, apply locally and schedule the canonical write.
    ///
    /// Returns the optimistic comment without waiting for the store.
    pub fn add_comment(&self, content: &str, author: &Author) -> Result<Comment, CollabError> {
        self.submit(content, author, |c| c)
    }

    /// A comment answering `parent_id`.
    pub fn reply(&self, parent_id: Uuid, content: &str, author: &Author) -> Result<Comment, CollabError> {
        self.submit(content, author, |c| c.in_reply_to(parent_id))
    }

    /// An edit, stored as a new comment pointing at `original_id`.
    pub fn add_revision(
        &self,
        original_id: Uuid,
        content: &str,
        author: &Author,
    ) -> Result<Comment, CollabError> {
        self.submit(content, author, |c| c.revising(original_id))
    }

    fn submit(
        &self,
        content: &str,
        author: &Author,
        shape: impl FnOnce(Comment) -> Comment,
    ) -> Result<Comment, CollabError> {
        validate(content, author)?;
        let comment = shape(Comment::new(self.room_id().ticket_id(), content, author));

        self.with_provisional(|p| {
            p.insert(comment.id, comment.clone());
        });
        match self.handle.session().add_comment(comment.clone()) {
            Ok(comment) => Ok(comment),
            Err(e) => {
                self.with_provisional(|p| {
                    p.remove(&comment.id);
                });
                Err(e)
            }
        }
    }

    fn with_provisional(&self, f: impl FnOnce(&mut HashMap<Uuid, Comment>)) {
        match self.provisional.lock() {
            Ok(mut p) => f(&mut p),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn set_typing_status(&self, typing: bool) -> Result<(), CollabError> {
        self.handle.session().set_typing(typing)
    }

    /// Rename the local user for everyone watching the room.
    pub fn set_display_name(&self, user_name: &str) -> Result<(), CollabError> {
        self.handle.session().set_display_name(user_name)
    }

    pub fn force_reconnect(&self) {
        self.handle.session().force_reconnect();
    }

    pub fn set_network_available(&self, available: bool) {
        self.handle.session().set_network_available(available);
    }

    // ─── Views ──────────────────────────────────────────────────────

    /// Ordered comments, including ones accepted but not yet reported by
    /// the log.
    pub fn comments(&self) -> Vec<Comment> {
        let mut list = self.handle.session().comments();
        let mut extra = Vec::new();
        self.with_provisional(|p| {
            p.retain(|id, _| !list.iter().any(|c| c.id == *id));
            extra.extend(p.values().cloned());
        });
        if !extra.is_empty() {
            list.extend(extra);
            list.sort_by_key(|c| c.order_key());
        }
        list
    }

    pub fn active_users(&self) -> Vec<ActiveUser> {
        self.handle.session().active_users()
    }

    /// User ids currently typing, without the local user.
    pub fn typing_users(&self) -> BTreeSet<String> {
        self.handle.session().typing_users()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.handle.session().connection_status()
    }

    pub fn pending_write_count(&self) -> usize {
        self.handle.session().pending_write_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.handle.session().subscribe()
    }
}

impl Drop for CommentThread {
    fn drop(&mut self) {
        self.handle.session().unobserve(self.token);
    }
}
