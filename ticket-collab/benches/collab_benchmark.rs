use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use ticket_collab::cache::{LocalCache, MemoryCache};
use ticket_collab::comment::{Author, Comment, RoomId};
use ticket_collab::document::CommentDoc;
use ticket_collab::presence::{AwarenessMessage, LocalIdentity, PresenceState};
use ticket_collab::protocol::SyncMessage;
use uuid::Uuid;

fn comments(n: usize) -> Vec<Comment> {
    let author = Author::new("u-1", "Alice");
    (0..n)
        .map(|i| {
            let mut c = Comment::new("T-1", &format!("comment number {i}"), &author);
            c.created_at = (n - i) as u64; // reverse order, so sorting does work
            c
        })
        .collect()
}

fn doc_with(n: usize) -> CommentDoc {
    let mut doc = CommentDoc::new();
    for c in comments(n) {
        doc.append_comment(&c).unwrap();
    }
    doc
}

fn bench_append_comment(c: &mut Criterion) {
    let author = Author::new("u-1", "Alice");
    c.bench_function("append_comment", |b| {
        let mut doc = CommentDoc::new();
        b.iter(|| {
            let comment = Comment::new("T-1", "a short comment", &author);
            black_box(doc.append_comment(black_box(&comment)).unwrap());
        })
    });
}

fn bench_merge_remote_update(c: &mut Criterion) {
    let mut source = CommentDoc::new();
    let update = source.append_comment(&comments(1)[0]).unwrap();

    c.bench_function("merge_remote_single_update", |b| {
        b.iter(|| {
            let mut doc = CommentDoc::new();
            black_box(doc.merge_remote(black_box(&update)).unwrap());
        })
    });
}

fn bench_merge_snapshot_1000(c: &mut Criterion) {
    let snapshot = doc_with(1000).encode_state();

    c.bench_function("load_snapshot_1000_comments", |b| {
        b.iter(|| {
            let mut doc = CommentDoc::new();
            black_box(doc.load_state(black_box(&snapshot)).unwrap());
        })
    });
}

fn bench_merge_history_1000(c: &mut Criterion) {
    let history = comments(1000);

    c.bench_function("merge_history_1000_comments", |b| {
        b.iter(|| {
            let mut doc = CommentDoc::new();
            black_box(doc.merge_history(black_box(&history)).unwrap());
        })
    });
}

fn bench_ordered_list_1000(c: &mut Criterion) {
    let doc = doc_with(1000);

    c.bench_function("to_ordered_list_1000", |b| {
        b.iter(|| {
            black_box(doc.to_ordered_list());
        })
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let room = RoomId::new("T-1");
    let update = vec![0u8; 128]; // Typical single-comment update

    c.bench_function("frame_encode_128B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(peer), &room, black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(Uuid::new_v4(), &RoomId::new("T-1"), vec![0u8; 128])
        .encode()
        .unwrap();

    c.bench_function("frame_decode_128B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_presence_100_peers(c: &mut Criterion) {
    let local = LocalIdentity::new("u-0", "Local");
    let joins: Vec<AwarenessMessage> = (0..100)
        .map(|i| AwarenessMessage::Join {
            peer_handle: Uuid::new_v4(),
            user_id: format!("u-{}", i % 50),
            user_name: format!("User {i}"),
            color_tag: "#3366cc".to_string(),
            typing: i % 3 == 0,
        })
        .collect();

    c.bench_function("presence_active_users_100_peers", |b| {
        b.iter(|| {
            let mut state = PresenceState::new(&local);
            for join in &joins {
                state.handle_message(join);
            }
            black_box(state.active_users());
            black_box(state.typing_users());
        })
    });
}

fn bench_cache_persist_snapshot(c: &mut Criterion) {
    let cache = MemoryCache::new();
    let room = RoomId::new("T-1");
    let doc = doc_with(200);

    c.bench_function("encode_and_persist_200_comments", |b| {
        b.iter(|| {
            cache.persist(&room, black_box(&doc.encode_state())).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_append_comment,
    bench_merge_remote_update,
    bench_merge_snapshot_1000,
    bench_merge_history_1000,
    bench_ordered_list_1000,
    bench_frame_encode,
    bench_frame_decode,
    bench_presence_100_peers,
    bench_cache_persist_snapshot,
);
criterion_main!(benches);
