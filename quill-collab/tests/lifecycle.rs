//! Session lifecycle and save timing, driven through the registry with a
//! paused clock so every deadline is exact.

use std::sync::Arc;
use std::time::Duration;

use quill_collab::auth::{ConnectionContext, Identity};
use quill_collab::events::{EventKind, Events, MemorySink};
use quill_collab::registry::SessionRegistry;
use quill_collab::session::PeerConnection;
use quill_collab::storage::MemoryStore;
use quill_collab::ServerConfig;
use quill_core::yrs::{XmlElementPrelim, XmlFragment, XmlTextPrelim};
use quill_core::{DocNode, Replica, XmlTreeTransform};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

struct Harness {
    registry: SessionRegistry,
    store: Arc<MemoryStore>,
    sink: Arc<MemorySink>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let config = ServerConfig {
        debounce: Duration::from_secs(3),
        max_debounce: Duration::from_secs(10),
        ..ServerConfig::default()
    };
    let registry = SessionRegistry::new(
        store.clone(),
        Arc::new(XmlTreeTransform::new()),
        Events::new(sink.clone()),
        config,
    );
    Harness { registry, store, sink }
}

fn peer(user: &str) -> PeerConnection {
    PeerConnection::new(
        Uuid::new_v4(),
        ConnectionContext::new(Identity::new(user, user), format!("token-{user}")),
    )
}

/// A client-side author producing paragraph updates.
struct Author {
    replica: Replica,
}

impl Author {
    fn new() -> Self {
        Self { replica: Replica::new() }
    }

    fn paragraph(&mut self, text: &str) -> Vec<u8> {
        self.replica.edit(|txn, root| {
            let p = root.push_back(txn, XmlElementPrelim::empty("paragraph"));
            p.push_back(txn, XmlTextPrelim::new(text));
        })
    }
}

fn saved_text(store: &MemoryStore, index: usize) -> String {
    let record = &store.saves()[index];
    DocNode::parse_document(&record.representation)
        .unwrap()
        .plain_text()
}

#[tokio::test(start_paused = true)]
async fn test_burst_flushes_once_at_max_debounce() {
    let h = harness();
    let alice = peer("alice");
    let id = alice.peer_id;
    let (session, _ack) = h.registry.acquire("d1", alice).await.unwrap();

    let mut author = Author::new();
    let start = Instant::now();
    for i in 0..10 {
        session.apply_update(id, author.paragraph(&format!("p{i}"))).await.unwrap();
        sleep(Duration::from_secs(1)).await;
    }

    sleep(Duration::from_secs(30)).await;
    let saves = h.store.saves();
    assert_eq!(saves.len(), 1, "one flush for the whole burst");
    assert_eq!(saves[0].at - start, Duration::from_secs(10));
    assert_eq!(saved_text(&h.store, 0), "p0p1p2p3p4p5p6p7p8p9");
}

#[tokio::test(start_paused = true)]
async fn test_single_edit_flushes_after_quiet_period() {
    let h = harness();
    let alice = peer("alice");
    let id = alice.peer_id;
    let (session, _ack) = h.registry.acquire("d1", alice).await.unwrap();

    let start = Instant::now();
    session.apply_update(id, Author::new().paragraph("f1")).await.unwrap();

    sleep(Duration::from_secs(60)).await;
    let saves = h.store.saves();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].at - start, Duration::from_secs(3));
    assert_eq!(saves[0].document_id, "d1");
    assert_eq!(h.sink.count(EventKind::StoreSuccess), 1);
}

#[tokio::test(start_paused = true)]
async fn test_edit_after_save_starts_new_streak() {
    let h = harness();
    let alice = peer("alice");
    let id = alice.peer_id;
    let (session, _ack) = h.registry.acquire("d1", alice).await.unwrap();
    let mut author = Author::new();

    session.apply_update(id, author.paragraph("one")).await.unwrap();
    sleep(Duration::from_secs(4)).await;
    assert_eq!(h.store.saves().len(), 1);
    session.apply_update(id, author.paragraph("two")).await.unwrap();
    sleep(Duration::from_secs(10)).await;

    assert_eq!(h.store.saves().len(), 2);
    assert_eq!(saved_text(&h.store, 1), "onetwo");
    assert!(!session.snapshot().await.unwrap().dirty);
}

#[tokio::test(start_paused = true)]
async fn test_last_leave_flushes_before_removal() {
    let h = harness();
    let alice = peer("alice");
    let id = alice.peer_id;
    let (session, _ack) = h.registry.acquire("d1", alice).await.unwrap();

    session.apply_update(id, Author::new().paragraph("unsaved")).await.unwrap();
    h.registry.release("d1", id).await;

    assert_eq!(h.store.saves().len(), 1);
    assert_eq!(saved_text(&h.store, 0), "unsaved");
    assert!(h.registry.get("d1").is_none());

    // Nothing left to fire later.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.store.saves().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clean_leave_does_not_save() {
    let h = harness();
    let alice = peer("alice");
    let id = alice.peer_id;
    let _ = h.registry.acquire("d1", alice).await.unwrap();

    h.registry.release("d1", id).await;
    assert_eq!(h.store.save_attempts(), 0);
    assert_eq!(h.registry.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_first_joins_share_one_load() {
    let h = harness();
    h.store.set_fetch_delay(Some(Duration::from_millis(100)));

    let (a, b) = (peer("alice"), peer("bob"));
    let (a_id, b_id) = (a.peer_id, b.peer_id);
    let (ra, rb) = tokio::join!(h.registry.acquire("d1", a), h.registry.acquire("d1", b));
    let (sa, _) = ra.unwrap();
    let (sb, _) = rb.unwrap();

    assert_eq!(h.store.fetch_count(), 1);
    assert_eq!(h.sink.count(EventKind::Load), 1);
    assert!(sa.same_session(&sb));

    let mut peers = vec![a_id, b_id];
    peers.sort();
    assert_eq!(sa.snapshot().await.unwrap().peer_ids, peers);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_session_still_edits_and_saves() {
    let h = harness();
    h.store.fail_fetches(true);

    let alice = peer("alice");
    let id = alice.peer_id;
    let (session, ack) = h.registry.acquire("d1", alice).await.unwrap();
    assert!(ack.degraded);

    session.apply_update(id, Author::new().paragraph("on empty base")).await.unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.store.saves().len(), 1);
    assert_eq!(saved_text(&h.store, 0), "on empty base");
}

#[tokio::test(start_paused = true)]
async fn test_persist_failures_retry_until_success() {
    let h = harness();
    h.store.fail_next_saves(3);

    let alice = peer("alice");
    let id = alice.peer_id;
    let (session, _ack) = h.registry.acquire("d1", alice).await.unwrap();

    let start = Instant::now();
    session.apply_update(id, Author::new().paragraph("persist me")).await.unwrap();
    sleep(Duration::from_secs(60)).await;

    assert_eq!(h.store.save_attempts(), 4);
    let saves = h.store.saves();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0].at - start, Duration::from_secs(12));
    assert_eq!(h.sink.count(EventKind::StoreFailure), 3);
}

#[tokio::test(start_paused = true)]
async fn test_new_generation_sees_saved_content() {
    let h = harness();
    let alice = peer("alice");
    let id = alice.peer_id;
    let (session, _ack) = h.registry.acquire("d1", alice).await.unwrap();
    session.apply_update(id, Author::new().paragraph("kept")).await.unwrap();
    h.registry.release("d1", id).await;

    let (next, ack) = h.registry.acquire("d1", peer("alice")).await.unwrap();
    let mut replica = Replica::new();
    replica.merge(&ack.state).unwrap();
    assert!(!replica.is_empty());
    assert_eq!(h.store.fetch_count(), 2);

    let snap = next.snapshot().await.unwrap();
    let text = DocNode::parse_document(&snap.representation.unwrap())
        .unwrap()
        .plain_text();
    assert_eq!(text, "kept");
}
