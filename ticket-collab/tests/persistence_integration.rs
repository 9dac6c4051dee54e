//! Persistence integration tests: sessions over a real RocksDB cache.
//!
//! Verifies:
//! - Reopening a room after a restart restores comments without network
//! - Remote merges are written through to the cache
//! - A failing cache never blocks local operation

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use ticket_collab::{
    Author, CacheConfig, CommentThread, LocalCache, LocalIdentity, MemoryCache, MemoryStore,
    MemoryTransport, RocksCache, RoomId, RoomRegistry, SessionConfig, SessionDeps,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn registry_with(cache: Arc<dyn LocalCache>, hub: &MemoryTransport, store: &MemoryStore) -> RoomRegistry {
    RoomRegistry::new(SessionDeps {
        transport: Arc::new(hub.clone()),
        cache,
        store: Arc::new(store.clone()),
        config: SessionConfig::for_testing(),
    })
}

fn open(registry: &RoomRegistry, user: &str) -> CommentThread {
    CommentThread::new(registry.acquire(RoomId::new("T-100"), LocalIdentity::new(user, user)))
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ─── Crash Recovery ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_restart_restores_comments_offline() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache");
    let hub = MemoryTransport::new();
    let store = MemoryStore::new();
    // Nothing but the cache can provide state
    hub.set_reachable(false);
    store.set_reachable(false);

    let written = {
        let cache = Arc::new(RocksCache::open(CacheConfig::for_testing(&path)).unwrap());
        let registry = registry_with(cache.clone(), &hub, &store);
        let thread = open(&registry, "alice");
        let author = Author::new("alice", "Alice");
        let first = thread.add_comment("survives", &author).unwrap();
        let second = thread.reply(first.id, "me too", &author).unwrap();
        drop(thread);
        drop(registry);

        // The driver holds the last references until it stops
        eventually("cache released", || Arc::strong_count(&cache) == 1).await;
        vec![first, second]
    };

    let cache = Arc::new(RocksCache::open(CacheConfig::for_testing(&path)).unwrap());
    assert!(cache.metadata(&RoomId::new("T-100")).unwrap().is_some());
    let registry = registry_with(cache, &hub, &store);
    let thread = open(&registry, "alice");

    // Hydration is synchronous with acquire
    let mut restored = thread.comments();
    let mut expected = written;
    restored.sort_by_key(|c| c.id);
    expected.sort_by_key(|c| c.id);
    assert_eq!(restored, expected);
}

#[tokio::test(start_paused = true)]
async fn test_remote_merges_are_cached() {
    let dir = TempDir::new().unwrap();
    let hub = MemoryTransport::new();
    let store = MemoryStore::new();

    let bob_cache = Arc::new(RocksCache::open(CacheConfig::for_testing(dir.path().join("bob"))).unwrap());
    let reg_a = registry_with(Arc::new(MemoryCache::new()), &hub, &store);
    let reg_b = registry_with(bob_cache.clone(), &hub, &store);
    let alice = open(&reg_a, "alice");
    let bob = open(&reg_b, "bob");

    let c = alice.add_comment("written by alice", &Author::new("alice", "Alice")).unwrap();
    eventually("bob merged", || bob.comments().len() == 1).await;

    // Bob's snapshot alone reproduces the comment
    let snapshot = bob_cache.load(&RoomId::new("T-100")).unwrap().unwrap();
    let mut doc = ticket_collab::CommentDoc::new();
    doc.load_state(&snapshot).unwrap();
    assert_eq!(doc.get(&c.id), Some(c));
}

#[tokio::test(start_paused = true)]
async fn test_cache_failure_is_not_fatal() {
    let hub = MemoryTransport::new();
    let store = MemoryStore::new();
    let cache = MemoryCache::new();
    cache.set_fail_writes(true);
    let registry = registry_with(Arc::new(cache.clone()), &hub, &store);
    let thread = open(&registry, "alice");

    let c = thread.add_comment("kept in memory", &Author::new("alice", "Alice")).unwrap();
    assert_eq!(thread.comments(), vec![c]);
    assert_eq!(cache.persist_count(), 0);
    eventually("stored canonically", || store.comments("T-100").len() == 1).await;
}
