//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full pipeline from handshake to save.

use std::sync::Arc;
use std::time::Duration;

use quill_collab::auth::{issue_token, JwtVerifier, StaticVerifier};
use quill_collab::client::{ClientError, ClientEvent, CollabClient};
use quill_collab::events::{EventKind, MemorySink};
use quill_collab::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig};
use quill_collab::{CollabError, Identity, IdentityVerifier, ServerConfig, SyncServer};
use quill_core::yrs::{XmlElementPrelim, XmlFragment, XmlTextPrelim};
use quill_core::DocNode;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const SECRET: &[u8] = b"integration-secret-long-enough-for-hs256";

fn test_config() -> ServerConfig {
    ServerConfig {
        debounce: Duration::from_millis(200),
        max_debounce: Duration::from_millis(1_000),
        ..ServerConfig::default()
    }
}

fn static_verifier() -> Arc<dyn IdentityVerifier> {
    Arc::new(
        StaticVerifier::new()
            .with_token("alice-token", "alice", "Alice")
            .with_token("bob-token", "bob", "Bob"),
    )
}

struct TestServer {
    server: SyncServer,
    url: String,
    serve: JoinHandle<Result<(), CollabError>>,
}

impl TestServer {
    /// Stop accepting and wait until the accept loop is gone.
    async fn stop(self) {
        self.server.shutdown().await;
        self.serve.abort();
        let _ = self.serve.await;
    }
}

/// Start a server on a free port.
async fn start_test_server(
    verifier: Arc<dyn IdentityVerifier>,
    store: Arc<dyn DocumentStore>,
    sink: Arc<MemorySink>,
) -> TestServer {
    let server = SyncServer::with_parts(
        test_config(),
        verifier,
        store,
        Arc::new(quill_core::XmlTreeTransform::new()),
        sink,
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let background = server.clone();
    let serve = tokio::spawn(async move { background.serve(listener).await });
    TestServer { server, url, serve }
}

/// Poll `cond` until it holds or two seconds pass.
async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Wait for the first event matching `pred`, skipping others.
async fn expect_event(client: &mut CollabClient, pred: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match client.next_event().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("connection closed while waiting for event"),
            }
        }
    })
    .await
    .expect("event within timeout")
}

async fn add_paragraph(client: &CollabClient, text: &str) {
    let text = text.to_string();
    client
        .edit(move |txn, root| {
            let p = root.push_back(txn, XmlElementPrelim::empty("paragraph"));
            p.push_back(txn, XmlTextPrelim::new(text.as_str()));
        })
        .await
        .unwrap();
}

fn text_of(client: &CollabClient) -> String {
    DocNode::parse_document(&client.representation().unwrap())
        .unwrap()
        .plain_text()
}

#[tokio::test]
async fn test_invalid_credential_never_touches_store() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let TestServer { server, url, .. } = start_test_server(static_verifier(), store.clone(), sink.clone()).await;

    let result = CollabClient::connect(&url, "d1", "forged").await;
    assert!(matches!(result, Err(ClientError::Rejected(_))));

    let result = CollabClient::connect(&url, "d1", "").await;
    match result {
        Err(ClientError::Rejected(reason)) => assert!(reason.contains("credential")),
        other => panic!("expected rejection, got {:?}", other.map(|c| c.peer_id())),
    }

    assert_eq!(store.fetch_count(), 0);
    assert_eq!(server.registry().session_count(), 0);
    assert_eq!(server.registry().ref_count("d1"), 0);
    assert_eq!(sink.count(EventKind::AuthFailure), 2);
    assert_eq!(sink.count(EventKind::Load), 0);
    assert_eq!(server.stats().auth_failures, 2);
}

#[tokio::test]
async fn test_single_peer_edit_saved_then_session_removed() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let TestServer { server, url, .. } = start_test_server(static_verifier(), store.clone(), sink.clone()).await;

    let mut alice = CollabClient::connect(&url, "d1", "alice-token").await.unwrap();
    assert!(!alice.welcome().degraded);
    expect_event(&mut alice, |e| *e == ClientEvent::Synced).await;
    assert_eq!(store.fetch_count(), 1);

    add_paragraph(&alice, "f1").await;
    assert!(wait_until(|| store.saves().len() == 1).await, "saved after quiet period");
    sleep(Duration::from_millis(500)).await;
    assert_eq!(store.saves().len(), 1, "exactly one save");

    let saved = &store.saves()[0];
    assert_eq!(saved.document_id, "d1");
    assert_eq!(saved.user_id, "alice");
    assert_eq!(saved.representation, alice.representation().unwrap());

    alice.close().await;
    assert!(wait_until(|| server.registry().session_count() == 0).await);
    assert_eq!(store.saves().len(), 1);
    assert!(wait_until(|| sink.count(EventKind::Disconnect) == 1).await);
}

#[tokio::test]
async fn test_simultaneous_peers_converge() {
    let store = Arc::new(MemoryStore::new());
    store.set_fetch_delay(Some(Duration::from_millis(50)));
    let TestServer { server, url, .. } = start_test_server(static_verifier(), store.clone(), Arc::new(MemorySink::new())).await;

    let (a, b) = tokio::join!(
        CollabClient::connect(&url, "d1", "alice-token"),
        CollabClient::connect(&url, "d1", "bob-token"),
    );
    let (mut alice, mut bob) = (a.unwrap(), b.unwrap());
    expect_event(&mut alice, |e| *e == ClientEvent::Synced).await;
    expect_event(&mut bob, |e| *e == ClientEvent::Synced).await;

    assert_eq!(store.fetch_count(), 1);
    assert_eq!(server.registry().session_count(), 1);
    assert_eq!(server.registry().ref_count("d1"), 2);

    add_paragraph(&alice, "from alice ").await;
    add_paragraph(&bob, "from bob").await;

    let alice_id = alice.peer_id();
    let bob_id = bob.peer_id();
    expect_event(&mut bob, |e| *e == ClientEvent::RemoteUpdate { peer_id: alice_id }).await;
    expect_event(&mut alice, |e| *e == ClientEvent::RemoteUpdate { peer_id: bob_id }).await;

    assert_eq!(alice.state_vector(), bob.state_vector());
    assert_eq!(alice.representation().unwrap(), bob.representation().unwrap());
    let text = text_of(&alice);
    assert!(text.contains("from alice") && text.contains("from bob"));

    alice.close().await;
    expect_event(&mut bob, |e| *e == ClientEvent::PeerLeft(alice_id)).await;
    bob.close().await;
    assert!(wait_until(|| server.registry().session_count() == 0).await);
}

#[tokio::test]
async fn test_late_joiner_receives_full_state() {
    let store = Arc::new(MemoryStore::new());
    let TestServer { url, .. } = start_test_server(static_verifier(), store.clone(), Arc::new(MemorySink::new())).await;

    let mut alice = CollabClient::connect(&url, "d1", "alice-token").await.unwrap();
    expect_event(&mut alice, |e| *e == ClientEvent::Synced).await;
    add_paragraph(&alice, "written before bob").await;

    // Ping round trip orders the update before bob's join.
    alice.ping().await.unwrap();
    expect_event(&mut alice, |e| *e == ClientEvent::Pong).await;

    let mut bob = CollabClient::connect(&url, "d1", "bob-token").await.unwrap();
    expect_event(&mut bob, |e| *e == ClientEvent::Synced).await;
    assert_eq!(text_of(&bob), "written before bob");
    assert!(matches!(
        expect_event(&mut bob, |e| matches!(e, ClientEvent::PeerJoined(_))).await,
        ClientEvent::PeerJoined(info) if info.user_id == "alice"
    ));
    assert!(matches!(
        expect_event(&mut alice, |e| matches!(e, ClientEvent::PeerJoined(_))).await,
        ClientEvent::PeerJoined(info) if info.name == "Bob"
    ));
}

#[tokio::test]
async fn test_sync_step1_returns_missing_updates() {
    let TestServer { url, .. } = start_test_server(
        static_verifier(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemorySink::new()),
    )
    .await;

    let mut alice = CollabClient::connect(&url, "d1", "alice-token").await.unwrap();
    expect_event(&mut alice, |e| *e == ClientEvent::Synced).await;
    let mut bob = CollabClient::connect(&url, "d1", "bob-token").await.unwrap();
    expect_event(&mut bob, |e| *e == ClientEvent::Synced).await;

    add_paragraph(&alice, "catch up").await;
    bob.request_sync().await.unwrap();

    // Either the relayed update or the requested diff delivers it.
    assert!(wait_until(|| bob.state_vector() == alice.state_vector()).await);
    assert_eq!(text_of(&bob), "catch up");
}

#[tokio::test]
async fn test_jwt_query_token_and_degraded_flag() {
    let store = Arc::new(MemoryStore::new());
    store.fail_fetches(true);
    let sink = Arc::new(MemorySink::new());
    let verifier: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::new(SECRET));
    let TestServer { server, url, .. } = start_test_server(verifier, store.clone(), sink.clone()).await;

    let token = issue_token(SECRET, &Identity::new("u-7", "Grace"), Duration::from_secs(60)).unwrap();
    let client = CollabClient::connect(&format!("{url}/?token={token}"), "d1", "")
        .await
        .unwrap();

    assert_eq!(client.welcome().peer.user_id, "u-7");
    assert_eq!(client.welcome().peer.name, "Grace");
    assert!(client.welcome().degraded);
    assert_eq!(server.stats().degraded_loads, 1);
    assert_eq!(server.stats().active_sessions, 1);
}

#[tokio::test]
async fn test_content_survives_restart_with_rocksdb() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let TestServer { server, url, .. } = start_test_server(static_verifier(), store, Arc::new(MemorySink::new())).await;
        let mut alice = CollabClient::connect(&url, "doc-r", "alice-token").await.unwrap();
        expect_event(&mut alice, |e| *e == ClientEvent::Synced).await;
        add_paragraph(&alice, "durable").await;
        alice.close().await;
        assert!(wait_until(|| server.registry().session_count() == 0).await);
        server.shutdown().await;
    }

    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let TestServer { url, .. } = start_test_server(static_verifier(), store, Arc::new(MemorySink::new())).await;
    let mut alice = CollabClient::connect(&url, "doc-r", "alice-token").await.unwrap();
    expect_event(&mut alice, |e| *e == ClientEvent::Synced).await;
    assert_eq!(text_of(&alice), "durable");

    // Not shared with bob.
    let denied = CollabClient::connect(&url, "doc-r", "bob-token").await;
    assert!(matches!(denied, Err(ClientError::Rejected(reason)) if reason == "access denied"));
}
