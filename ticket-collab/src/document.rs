//! Replicated append-only comment log backed by a Yrs document.
//!
//! The log is a single root map `"comments"` keyed by comment id, each value
//! a JSON-encoded [`Comment`]. Because ids are globally unique and never
//! rewritten, the map behaves as a grow-only set:
//!
//! - appends commute with remote merges (map inserts on distinct keys)
//! - re-applying an update is a no-op (Yrs skips known blocks)
//! - two replicas inserting the same historical comment converge to one entry
//!
//! Materialization sorts by `(created_at, id)`, so every replica that has seen
//! the same updates produces the same list regardless of arrival order.

use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, Update};

use crate::comment::Comment;
use crate::error::DocError;

const COMMENTS_ROOT: &str = "comments";

/// Where a change to the log came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// `append_comment` on this replica.
    Local,
    /// A peer's update arriving over the transport.
    Remote,
    /// Canonical-store history replayed by reconciliation.
    History,
    /// State restored from the local cache.
    Cache,
}

/// Notification delivered to observers after the log changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocChange {
    pub origin: ChangeOrigin,
    /// Comment ids that became visible with this change.
    pub added: Vec<Uuid>,
}

/// Result of applying a remote update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: Vec<Uuid>,
}

impl MergeOutcome {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
    }
}

/// Handle returned by [`CommentDoc::observe`]; pass it to `unobserve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

type Observer = Arc<dyn Fn(&DocChange) + Send + Sync>;

/// The replicated comment log of one room.
pub struct CommentDoc {
    doc: Doc,
    comments: MapRef,
    /// Ids materialized so far; used to diff merges.
    known: HashSet<Uuid>,
    observers: Vec<(ObserverToken, Observer)>,
    next_token: u64,
}

impl CommentDoc {
    pub fn new() -> Self {
        let doc = Doc::new();
        let comments = doc.get_or_insert_map(COMMENTS_ROOT);
        Self {
            doc,
            comments,
            known: HashSet::new(),
            observers: Vec::new(),
            next_token: 0,
        }
    }

    /// Append a locally authored comment and return the update to broadcast.
    ///
    /// Appending an id that is already present changes nothing and returns an
    /// empty update.
    pub fn append_comment(&mut self, comment: &Comment) -> Result<Vec<u8>, DocError> {
        if self.known.contains(&comment.id) {
            return Ok(Vec::new());
        }
        let json = comment
            .to_json()
            .map_err(|e| DocError::Encode(e.to_string()))?;

        let update = {
            let mut txn = self.doc.transact_mut();
            self.comments.insert(&mut txn, comment.id.to_string(), json);
            txn.encode_update_v1()
        };
        self.known.insert(comment.id);
        Ok(update)
    }

    /// Apply a remote-origin update. Idempotent.
    pub fn merge_remote(&mut self, update: &[u8]) -> Result<MergeOutcome, DocError> {
        let update = Update::decode_v1(update)?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocError::Apply(e.to_string()))?;
        }
        Ok(MergeOutcome {
            added: self.collect_new_ids(),
        })
    }

    /// Insert canonical-store history, skipping ids already present.
    ///
    /// Returns the ids that were actually inserted.
    pub fn merge_history(&mut self, history: &[Comment]) -> Result<Vec<Uuid>, DocError> {
        let missing: Vec<&Comment> = history
            .iter()
            .filter(|c| !self.known.contains(&c.id))
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let mut encoded = Vec::with_capacity(missing.len());
        for comment in &missing {
            let json = comment
                .to_json()
                .map_err(|e| DocError::Encode(e.to_string()))?;
            encoded.push((comment.id, json));
        }

        let mut inserted = Vec::with_capacity(encoded.len());
        {
            let mut txn = self.doc.transact_mut();
            for (id, json) in encoded {
                // A duplicate inside `history` itself must not be inserted twice.
                if self.known.insert(id) {
                    self.comments.insert(&mut txn, id.to_string(), json);
                    inserted.push(id);
                }
            }
        }
        Ok(inserted)
    }

    /// Materialized comment list in the replica-independent total order.
    pub fn to_ordered_list(&self) -> Vec<Comment> {
        let txn = self.doc.transact();
        let mut list: Vec<Comment> = self
            .comments
            .iter(&txn)
            .filter_map(|(key, value)| decode_entry(key, value))
            .collect();
        list.sort_by_key(|c| c.order_key());
        list
    }

    /// Look up a single comment.
    pub fn get(&self, id: &Uuid) -> Option<Comment> {
        let txn = self.doc.transact();
        let key = id.to_string();
        self.comments
            .get(&txn, &key)
            .and_then(|value| decode_entry(&key, value))
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.known.contains(id)
    }

    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.comments.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoded state vector for the sync handshake (step 1).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the holder of `remote_sv` is missing (step 2).
    pub fn diff_since(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full document state as a single update (cache snapshot).
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Restore from a cached snapshot. Merges rather than replaces.
    pub fn load_state(&mut self, snapshot: &[u8]) -> Result<Vec<Uuid>, DocError> {
        self.merge_remote(snapshot).map(|outcome| outcome.added)
    }

    /// Register a change callback.
    ///
    /// Callbacks run synchronously on the thread that mutated the log while
    /// the owning session is locked; they must not call back into the session.
    pub fn observe<F>(&mut self, callback: F) -> ObserverToken
    where
        F: Fn(&DocChange) + Send + Sync + 'static,
    {
        let token = ObserverToken(self.next_token);
        self.next_token += 1;
        self.observers.push((token, Arc::new(callback)));
        token
    }

    /// Remove a callback. Returns false if the token was unknown.
    pub fn unobserve(&mut self, token: ObserverToken) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(t, _)| *t != token);
        self.observers.len() != before
    }

    /// Drop every registered callback (session teardown).
    pub fn clear_observers(&mut self) {
        self.observers.clear();
    }

    /// Deliver a change to every observer. Empty changes are not delivered.
    pub fn notify(&self, change: &DocChange) {
        if change.added.is_empty() {
            return;
        }
        for (_, observer) in &self.observers {
            observer(change);
        }
    }

    fn collect_new_ids(&mut self) -> Vec<Uuid> {
        let txn = self.doc.transact();
        let mut added = Vec::new();
        for (key, _) in self.comments.iter(&txn) {
            if let Ok(id) = Uuid::parse_str(key) {
                if self.known.insert(id) {
                    added.push(id);
                }
            }
        }
        added
    }
}

impl Default for CommentDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_entry(key: &str, value: Out) -> Option<Comment> {
    match value {
        Out::Any(Any::String(json)) => match Comment::from_json(&json) {
            Ok(comment) => Some(comment),
            Err(e) => {
                log::warn!("Skipping undecodable comment {key}: {e}");
                None
            }
        },
        _ => {
            log::warn!("Skipping non-string comment entry {key}");
            None
        }
    }
}
