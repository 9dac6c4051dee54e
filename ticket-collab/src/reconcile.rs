//! Reconciliation with the canonical comment store.
//!
//! The canonical store stays the system of record for clients that never
//! join a live session. Three paths keep it and the replicated log in step:
//!
//! 1. **History load** at session start: `list_comments`, merge the ids the
//!    log is missing. Historical comments are neither broadcast eagerly nor
//!    written back.
//! 2. **Dual-write**: every locally authored comment is appended to the
//!    store after it is already visible locally.
//! 3. **Pending writes**: failed appends wait in a [`PendingWriteQueue`] and
//!    are retried by the session's flush loop with growing spacing until they
//!    succeed or reach the attempt bound.
//!
//! Delivery is at-least-once; the store's append is idempotent on comment id.

use futures_util::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::comment::Comment;
use crate::error::StoreError;

// ───────────────────────────────────────────────────────────────────
// Canonical store
// ───────────────────────────────────────────────────────────────────

/// The durable system of record for ticket comments.
pub trait CanonicalStore: Send + Sync {
    /// Full comment history of a ticket.
    fn list_comments(&self, ticket_id: &str) -> BoxFuture<'static, Result<Vec<Comment>, StoreError>>;

    /// Append a comment. Appending an id that already exists succeeds
    /// without creating a duplicate.
    fn append_comment(
        &self,
        ticket_id: &str,
        comment: Comment,
    ) -> BoxFuture<'static, Result<(), StoreError>>;
}

#[derive(Default)]
struct StoreInner {
    tickets: Mutex<HashMap<String, Vec<Comment>>>,
    unreachable: AtomicBool,
    latency_ms: AtomicUsize,
    list_calls: AtomicUsize,
    append_calls: AtomicUsize,
}

impl StoreInner {
    async fn simulate_network(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency as u64)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable);
        }
        Ok(())
    }
}

/// In-process canonical store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Delay every call by `latency` (tokio time).
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as usize, Ordering::SeqCst);
    }

    /// Insert history directly, as if written by another client.
    pub fn seed(&self, ticket_id: &str, comments: Vec<Comment>) {
        if let Ok(mut tickets) = self.inner.tickets.lock() {
            let entry = tickets.entry(ticket_id.to_string()).or_default();
            for comment in comments {
                if !entry.iter().any(|c| c.id == comment.id) {
                    entry.push(comment);
                }
            }
        }
    }

    /// Stored comments of a ticket, in append order.
    pub fn comments(&self, ticket_id: &str) -> Vec<Comment> {
        self.inner
            .tickets
            .lock()
            .map(|tickets| tickets.get(ticket_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn append_calls(&self) -> usize {
        self.inner.append_calls.load(Ordering::SeqCst)
    }
}

impl CanonicalStore for MemoryStore {
    fn list_comments(&self, ticket_id: &str) -> BoxFuture<'static, Result<Vec<Comment>, StoreError>> {
        let inner = self.inner.clone();
        let ticket_id = ticket_id.to_string();
        Box::pin(async move {
            inner.list_calls.fetch_add(1, Ordering::SeqCst);
            inner.simulate_network().await?;
            let tickets = inner
                .tickets
                .lock()
                .map_err(|e| StoreError::Io(e.to_string()))?;
            Ok(tickets.get(&ticket_id).cloned().unwrap_or_default())
        })
    }

    fn append_comment(
        &self,
        ticket_id: &str,
        comment: Comment,
    ) -> BoxFuture<'static, Result<(), StoreError>> {
        let inner = self.inner.clone();
        let ticket_id = ticket_id.to_string();
        Box::pin(async move {
            inner.append_calls.fetch_add(1, Ordering::SeqCst);
            inner.simulate_network().await?;
            if comment.ticket_id != ticket_id {
                return Err(StoreError::Rejected(format!(
                    "comment belongs to {}, not {ticket_id}",
                    comment.ticket_id
                )));
            }
            let mut tickets = inner
                .tickets
                .lock()
                .map_err(|e| StoreError::Io(e.to_string()))?;
            let entry = tickets.entry(ticket_id).or_default();
            if !entry.iter().any(|c| c.id == comment.id) {
                entry.push(comment);
            }
            Ok(())
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Pending writes
// ───────────────────────────────────────────────────────────────────

/// A canonical append that failed and is waiting for a retry.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub ticket_id: String,
    pub comment: Comment,
    /// Attempts made so far (the initial dual-write counts as one).
    pub attempts: u32,
    pub next_retry_at: Instant,
    pub last_error: StoreError,
}

/// What happened to a write handed back after a failed retry.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Re-queued for a later attempt.
    Requeued,
    /// Attempt bound reached; the write was dropped.
    Abandoned(PendingWrite),
}

/// Bounded FIFO of failed canonical appends.
///
/// Writes taken with [`take_due`](Self::take_due) are in flight until handed
/// back through `complete` or `retry_failed`; they still count in `len()`.
pub struct PendingWriteQueue {
    queue: VecDeque<PendingWrite>,
    in_flight: usize,
    capacity: usize,
    max_attempts: u32,
    base_spacing: Duration,
}

/// Retry spacing stops growing after this many doublings.
const MAX_SPACING_DOUBLINGS: u32 = 5;

impl PendingWriteQueue {
    pub fn new(capacity: usize, max_attempts: u32, base_spacing: Duration) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            in_flight: 0,
            capacity,
            max_attempts,
            base_spacing,
        }
    }

    /// Delay before the next attempt once `attempts` have failed.
    pub fn retry_spacing(&self, attempts: u32) -> Duration {
        let doublings = attempts.saturating_sub(1).min(MAX_SPACING_DOUBLINGS);
        self.base_spacing * 2u32.pow(doublings)
    }

    /// Queue a write whose first attempt failed.
    ///
    /// When the queue is full the new write is refused and returned; queued
    /// writes are kept oldest-first.
    pub fn enqueue(
        &mut self,
        ticket_id: impl Into<String>,
        comment: Comment,
        error: StoreError,
        now: Instant,
    ) -> Result<(), PendingWrite> {
        let write = PendingWrite {
            ticket_id: ticket_id.into(),
            comment,
            attempts: 1,
            next_retry_at: now + self.retry_spacing(1),
            last_error: error,
        };
        if self.len() >= self.capacity || write.attempts >= self.max_attempts {
            return Err(write);
        }
        self.queue.push_back(write);
        Ok(())
    }

    /// Remove and return every write due at `now` (all of them if `force`).
    pub fn take_due(&mut self, now: Instant, force: bool) -> Vec<PendingWrite> {
        let mut due = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.queue.len());
        for write in self.queue.drain(..) {
            if force || write.next_retry_at <= now {
                due.push(write);
            } else {
                waiting.push_back(write);
            }
        }
        self.queue = waiting;
        self.in_flight += due.len();
        due
    }

    /// An in-flight write succeeded.
    pub fn complete(&mut self, _write: PendingWrite) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// An in-flight write failed again.
    pub fn retry_failed(&mut self, mut write: PendingWrite, error: StoreError, now: Instant) -> RetryOutcome {
        self.in_flight = self.in_flight.saturating_sub(1);
        write.attempts += 1;
        write.last_error = error;
        if write.attempts >= self.max_attempts {
            return RetryOutcome::Abandoned(write);
        }
        write.next_retry_at = now + self.retry_spacing(write.attempts);
        self.queue.push_back(write);
        RetryOutcome::Requeued
    }

    /// Queued plus in-flight writes.
    pub fn len(&self) -> usize {
        self.queue.len() + self.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Queued write for a comment, if any.
    pub fn get(&self, comment_id: &uuid::Uuid) -> Option<&PendingWrite> {
        self.queue.iter().find(|w| w.comment.id == *comment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comment::Author;

    fn comment(ticket: &str, content: &str) -> Comment {
        Comment::new(ticket, content, &Author::new("u-1", "Alice"))
    }

    #[tokio::test]
    async fn test_memory_store_append_is_idempotent() {
        let store = MemoryStore::new();
        let c = comment("T-1", "hello");
        store.append_comment("T-1", c.clone()).await.unwrap();
        store.append_comment("T-1", c.clone()).await.unwrap();

        let listed = store.list_comments("T-1").await.unwrap();
        assert_eq!(listed, vec![c]);
        assert_eq!(store.append_calls(), 2);
        assert_eq!(store.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_unreachable() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        assert_eq!(
            store.append_comment("T-1", comment("T-1", "x")).await,
            Err(StoreError::Unreachable)
        );
        assert_eq!(store.list_comments("T-1").await, Err(StoreError::Unreachable));
        store.set_reachable(true);
        assert!(store.list_comments("T-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_rejects_wrong_ticket() {
        let store = MemoryStore::new();
        let result = store.append_comment("T-2", comment("T-1", "x")).await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_due_and_spacing() {
        let mut queue = PendingWriteQueue::new(8, 5, Duration::from_millis(100));
        let now = Instant::now();
        queue
            .enqueue("T-1", comment("T-1", "a"), StoreError::Unreachable, now)
            .unwrap();
        assert_eq!(queue.len(), 1);

        assert!(queue.take_due(now, false).is_empty());
        let due = queue.take_due(now + Duration::from_millis(100), false);
        assert_eq!(due.len(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight(), 1);

        let later = now + Duration::from_millis(100);
        let outcome = queue.retry_failed(due[0].clone(), StoreError::Unreachable, later);
        assert_eq!(outcome, RetryOutcome::Requeued);
        let requeued = queue.get(&due[0].comment.id).unwrap();
        assert_eq!(requeued.attempts, 2);
        assert_eq!(requeued.next_retry_at, later + Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_success_removes() {
        let mut queue = PendingWriteQueue::new(8, 5, Duration::from_millis(100));
        let now = Instant::now();
        queue
            .enqueue("T-1", comment("T-1", "a"), StoreError::Unreachable, now)
            .unwrap();
        let mut due = queue.take_due(now, true);
        queue.complete(due.remove(0));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_abandons_at_attempt_bound() {
        let mut queue = PendingWriteQueue::new(8, 3, Duration::from_millis(10));
        let now = Instant::now();
        queue
            .enqueue("T-1", comment("T-1", "a"), StoreError::Unreachable, now)
            .unwrap();

        let write = queue.take_due(now, true).remove(0);
        assert_eq!(queue.retry_failed(write, StoreError::Unreachable, now), RetryOutcome::Requeued);

        let write = queue.take_due(now, true).remove(0);
        match queue.retry_failed(write, StoreError::Io("disk".into()), now) {
            RetryOutcome::Abandoned(w) => {
                assert_eq!(w.attempts, 3);
                assert_eq!(w.last_error, StoreError::Io("disk".into()));
            }
            other => panic!("Expected abandonment, got {other:?}"),
        }
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_refuses_newest() {
        let mut queue = PendingWriteQueue::new(2, 5, Duration::from_millis(10));
        let now = Instant::now();
        let first = comment("T-1", "1");
        queue.enqueue("T-1", first.clone(), StoreError::Unreachable, now).unwrap();
        queue.enqueue("T-1", comment("T-1", "2"), StoreError::Unreachable, now).unwrap();

        let refused = queue
            .enqueue("T-1", comment("T-1", "3"), StoreError::Unreachable, now)
            .unwrap_err();
        assert_eq!(refused.comment.content, "3");
        assert_eq!(queue.len(), 2);
        assert!(queue.get(&first.id).is_some());
    }
}
