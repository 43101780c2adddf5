//! Replica Session: one live document.
//!
//! Each session is an actor task that exclusively owns the document's
//! [`Replica`], its peer set and its [`DebounceScheduler`]. All mutations
//! arrive as commands on one mailbox and are handled one at a time, so merge
//! order, the dirty flag and scheduling never race.
//!
//! ```text
//! gateway ──cmd──►┌──────────── session task ────────────┐
//! gateway ──cmd──►│ Replica · peers · DebounceScheduler  │──save──► DocumentStore
//!                 │        │                             │  (spawned, result
//!                 │        └──► BroadcastGroup ──► feeds │◄── comes back as a msg)
//!                 └──────────────────────────────────────┘
//! ```
//!
//! Saves run on their own task so edits keep merging while the store is
//! slow; at most one save is in flight per session. Transient store errors
//! are retried at the debounce cadence. A save the store refuses is retried
//! as another connected user; when nobody is left, or the replica cannot be
//! represented, the session stops retrying until the next edit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use quill_core::{Replica, ReplicaError, ReplicaTransform, Representation, TransformError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::ConnectionContext;
use crate::broadcast::{BroadcastGroup, PeerFeed};
use crate::events::{CollabEvent, EventKind, Events, Outcome};
use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};
use crate::scheduler::DebounceScheduler;
use crate::storage::{DocumentStore, StoreError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Access to document {0} denied")]
    Forbidden(String),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistError {
    #[error("Could not build representation: {0}")]
    Transform(#[from] TransformError),
    #[error("Save failed: {0}")]
    Store(#[from] StoreError),
    #[error("No connected user may save this document")]
    NoWriter,
    #[error("Session is closed")]
    SessionClosed,
}

/// A connected peer, owned by its session.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub peer_id: Uuid,
    pub context: ConnectionContext,
    pub joined_at: SystemTime,
}

impl PeerConnection {
    pub fn new(peer_id: Uuid, context: ConnectionContext) -> Self {
        Self {
            peer_id,
            context,
            joined_at: SystemTime::now(),
        }
    }

    pub fn info(&self) -> PeerInfo {
        let identity = self.context.identity();
        PeerInfo::new(self.peer_id, identity.user_id.clone(), identity.display_name.clone())
    }
}

/// Reply to a join.
pub struct JoinAck {
    /// Everything other peers send from now on
    pub feed: PeerFeed,
    /// Full replica state at the moment of joining
    pub state: Vec<u8>,
    pub degraded: bool,
    /// Peers already present
    pub peers: Vec<PeerInfo>,
}

/// Point-in-time view of a session, for tests and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub document_id: String,
    pub peer_ids: Vec<Uuid>,
    pub dirty: bool,
    pub degraded: bool,
    pub flushes: u64,
    pub failed_flushes: u64,
    /// `None` if the replica cannot currently be represented
    pub representation: Option<Representation>,
}

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub debounce: Duration,
    pub max_debounce: Duration,
    pub broadcast_capacity: usize,
    pub command_capacity: usize,
}

/// Everything a session needs at start.
pub struct SessionInit {
    pub document_id: String,
    pub replica: Replica,
    pub degraded: bool,
    /// Context of the connection that triggered the load
    pub loader: ConnectionContext,
    pub store: Arc<dyn DocumentStore>,
    pub transform: Arc<dyn ReplicaTransform>,
    pub events: Events,
    pub config: SessionConfig,
}

enum Command {
    Join {
        peer: PeerConnection,
        reply: oneshot::Sender<JoinAck>,
    },
    Update {
        peer_id: Uuid,
        fragment: Vec<u8>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Diff {
        state_vector: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, SessionError>>,
    },
    State {
        reply: oneshot::Sender<Vec<u8>>,
    },
    Leave {
        peer_id: Uuid,
        reply: oneshot::Sender<usize>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), PersistError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    document_id: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("document_id", &self.document_id)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl SessionHandle {
    /// Start the session task.
    pub fn spawn(init: SessionInit) -> Self {
        let (tx, rx) = mpsc::channel(init.config.command_capacity.max(1));
        let document_id: Arc<str> = Arc::from(init.document_id.as_str());
        let actor = SessionActor::new(init, rx);
        tokio::spawn(actor.run());
        Self { document_id, tx }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// The session task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Same underlying session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Add a peer and subscribe it to the session broadcast.
    pub async fn add_peer(&self, peer: PeerConnection) -> Result<JoinAck, SessionError> {
        self.request(|reply| Command::Join { peer, reply }).await
    }

    /// Merge a peer's fragment and relay it to everyone else.
    pub async fn apply_update(&self, peer_id: Uuid, fragment: Vec<u8>) -> Result<(), SessionError> {
        self.request(|reply| Command::Update {
            peer_id,
            fragment,
            reply,
        })
        .await?
    }

    /// What a peer with `state_vector` is missing.
    pub async fn diff(&self, state_vector: Vec<u8>) -> Result<Vec<u8>, SessionError> {
        self.request(|reply| Command::Diff { state_vector, reply }).await?
    }

    pub async fn encode_state(&self) -> Result<Vec<u8>, SessionError> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Remove a peer; returns how many remain.
    pub async fn remove_peer(&self, peer_id: Uuid) -> Result<usize, SessionError> {
        self.request(|reply| Command::Leave { peer_id, reply }).await
    }

    /// Save now instead of waiting for a deadline. Resolves once a save
    /// covering every edit merged before this call has finished.
    pub async fn flush_now(&self) -> Result<(), PersistError> {
        self.request(|reply| Command::Flush { reply })
            .await
            .map_err(|_| PersistError::SessionClosed)?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Flush, then stop the task. Transient save failures are retried at the
    /// debounce cadence; a save that cannot succeed is given up with an error
    /// log so teardown always finishes.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Close { reply }).await
    }
}

/// Outcome of a spawned save.
struct FlushDone {
    user_id: String,
    result: Result<(), StoreError>,
}

struct SessionActor {
    document_id: String,
    replica: Replica,
    degraded: bool,
    peers: HashMap<Uuid, PeerConnection>,
    scheduler: DebounceScheduler,
    broadcast: BroadcastGroup,
    loader: ConnectionContext,
    last_editor: Option<ConnectionContext>,
    /// Users whose saves the store refused
    refused: HashSet<String>,
    store: Arc<dyn DocumentStore>,
    transform: Arc<dyn ReplicaTransform>,
    events: Events,
    rx: mpsc::Receiver<Command>,
    rx_open: bool,
    flush_tx: mpsc::UnboundedSender<FlushDone>,
    flush_rx: mpsc::UnboundedReceiver<FlushDone>,
    /// Waiting for the save currently in flight
    inflight_waiters: Vec<oneshot::Sender<Result<(), PersistError>>>,
    /// Waiting for a save that has not started yet
    pending_waiters: Vec<oneshot::Sender<Result<(), PersistError>>>,
    closing: Option<Vec<oneshot::Sender<()>>>,
    flushes: u64,
    failed_flushes: u64,
}

impl SessionActor {
    fn new(init: SessionInit, rx: mpsc::Receiver<Command>) -> Self {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        Self {
            scheduler: DebounceScheduler::new(init.config.debounce, init.config.max_debounce),
            broadcast: BroadcastGroup::new(init.config.broadcast_capacity),
            document_id: init.document_id,
            replica: init.replica,
            degraded: init.degraded,
            peers: HashMap::new(),
            loader: init.loader,
            last_editor: None,
            refused: HashSet::new(),
            store: init.store,
            transform: init.transform,
            events: init.events,
            rx,
            rx_open: true,
            flush_tx,
            flush_rx,
            inflight_waiters: Vec::new(),
            pending_waiters: Vec::new(),
            closing: None,
            flushes: 0,
            failed_flushes: 0,
        }
    }

    async fn run(mut self) {
        log::debug!("Session {} started", self.document_id);
        loop {
            let deadline = self.scheduler.next_deadline();
            tokio::select! {
                cmd = self.rx.recv(), if self.rx_open => match cmd {
                    Some(cmd) => self.handle(cmd),
                    // Every handle dropped: behave as if closed.
                    None => {
                        self.rx_open = false;
                        self.begin_close(None);
                    }
                },
                Some(done) = self.flush_rx.recv() => self.on_flush_done(done),
                _ = sleep_until(deadline) => self.start_flush(),
            }

            if self.closing.is_some() && self.scheduler.is_settled() {
                break;
            }
        }

        if self.scheduler.is_stalled() {
            log::error!("Session {} closed with unsaved edits", self.document_id);
        }

        for waiter in self.closing.take().unwrap_or_default() {
            let _ = waiter.send(());
        }
        log::info!(
            "Session {} closed ({} saves, {} failed)",
            self.document_id,
            self.flushes,
            self.failed_flushes
        );
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Join { peer, reply } => {
                let peer_id = peer.peer_id;
                if reply.send(self.add_peer(peer)).is_err() {
                    // The joiner went away before the ack arrived.
                    self.remove_peer(peer_id);
                }
            }
            Command::Update {
                peer_id,
                fragment,
                reply,
            } => {
                let _ = reply.send(self.apply_update(peer_id, fragment));
            }
            Command::Diff { state_vector, reply } => {
                let _ = reply.send(self.replica.diff(&state_vector).map_err(SessionError::from));
            }
            Command::State { reply } => {
                let _ = reply.send(self.replica.encode_state());
            }
            Command::Leave { peer_id, reply } => {
                let _ = reply.send(self.remove_peer(peer_id));
            }
            Command::Flush { reply } => self.request_flush(reply),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Close { reply } => self.begin_close(Some(reply)),
        }
    }

    fn add_peer(&mut self, peer: PeerConnection) -> JoinAck {
        let info = peer.info();
        let peers = self.peers.values().map(PeerConnection::info).collect();

        // Subscribe before encoding so nothing merged afterwards is missed.
        let feed = self.broadcast.subscribe(peer.peer_id);
        let state = self.replica.encode_state();

        match SyncMessage::peer_joined(self.document_id.as_str(), &info) {
            Ok(msg) => {
                let _ = self.broadcast.fan_out(peer.peer_id, &msg);
            }
            Err(e) => log::warn!("Could not announce peer {}: {e}", peer.peer_id),
        }

        log::info!(
            "Peer {} ({}) joined {} ({} peers)",
            info.name,
            info.peer_id,
            self.document_id,
            self.peers.len() + 1
        );
        self.peers.insert(peer.peer_id, peer);

        JoinAck {
            feed,
            state,
            degraded: self.degraded,
            peers,
        }
    }

    fn apply_update(&mut self, peer_id: Uuid, fragment: Vec<u8>) -> Result<(), SessionError> {
        match self.replica.merge_changed(&fragment) {
            Ok(true) => {}
            Ok(false) => {
                log::trace!("Update from {peer_id} on {} already merged", self.document_id);
                return Ok(());
            }
            Err(e) => {
                log::warn!("Rejected update from {peer_id} on {}: {e}", self.document_id);
                return Err(e.into());
            }
        }

        if let Some(peer) = self.peers.get(&peer_id) {
            self.last_editor = Some(peer.context.clone());
        }
        self.scheduler.on_edit(Instant::now());

        let msg = SyncMessage::update(peer_id, self.document_id.as_str(), fragment);
        let reached = self.broadcast.fan_out(peer_id, &msg)?;
        log::trace!("Update from {peer_id} on {} reached {reached} receivers", self.document_id);
        Ok(())
    }

    fn remove_peer(&mut self, peer_id: Uuid) -> usize {
        if self.peers.remove(&peer_id).is_some() {
            let _ = self
                .broadcast
                .fan_out(peer_id, &SyncMessage::peer_left(peer_id, self.document_id.as_str()));
            log::info!("Peer {peer_id} left {} ({} remain)", self.document_id, self.peers.len());
        }
        self.peers.len()
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut peer_ids: Vec<Uuid> = self.peers.keys().copied().collect();
        peer_ids.sort();
        SessionSnapshot {
            document_id: self.document_id.clone(),
            peer_ids,
            dirty: self.scheduler.is_dirty(),
            degraded: self.degraded,
            flushes: self.flushes,
            failed_flushes: self.failed_flushes,
            representation: self.transform.from_replica(&self.replica).ok(),
        }
    }

    fn request_flush(&mut self, reply: oneshot::Sender<Result<(), PersistError>>) {
        if !self.scheduler.is_dirty() {
            let _ = reply.send(Ok(()));
            return;
        }
        self.pending_waiters.push(reply);
        if !self.scheduler.in_flight() {
            self.start_flush();
        }
    }

    fn begin_close(&mut self, reply: Option<oneshot::Sender<()>>) {
        let waiters = self.closing.get_or_insert_with(Vec::new);
        waiters.extend(reply);
        // Skip the debounce wait; a failed save still retries on its deadline.
        if self.scheduler.has_pending() && !self.scheduler.in_flight() {
            self.start_flush();
        }
    }

    fn start_flush(&mut self) {
        if self.scheduler.in_flight() {
            return;
        }
        self.scheduler.begin_flush();
        self.inflight_waiters.append(&mut self.pending_waiters);

        let representation = match self.transform.from_replica(&self.replica) {
            Ok(r) => r,
            Err(e) => {
                log::error!("Cannot represent {} for saving: {e}", self.document_id);
                let user_id = self.save_user();
                self.finish_flush(Err(PersistError::Transform(e)), user_id);
                return;
            }
        };
        let Some(ctx) = self.save_context() else {
            log::error!("Every user of {} was refused by the store", self.document_id);
            let user_id = self.loader.user_id().to_string();
            self.finish_flush(Err(PersistError::NoWriter), user_id);
            return;
        };

        if self.degraded {
            log::warn!(
                "Saving degraded session {}: its content did not start from the stored version",
                self.document_id
            );
        }

        let store = self.store.clone();
        let document_id = self.document_id.clone();
        let done = self.flush_tx.clone();
        tokio::spawn(async move {
            let result = store.save(&document_id, &ctx, &representation).await;
            let _ = done.send(FlushDone {
                user_id: ctx.user_id().to_string(),
                result,
            });
        });
    }

    fn on_flush_done(&mut self, done: FlushDone) {
        if let Err(StoreError::Forbidden { .. }) = &done.result {
            log::warn!("Store refused {} saving {}", done.user_id, self.document_id);
            self.refused.insert(done.user_id.clone());
        }
        self.finish_flush(done.result.map_err(PersistError::Store), done.user_id);
    }

    fn finish_flush(&mut self, result: Result<(), PersistError>, user_id: String) {
        match &result {
            Ok(()) => {
                self.scheduler.flush_succeeded();
                self.flushes += 1;
                log::debug!("Saved {}", self.document_id);
                self.events.emit(
                    CollabEvent::new(EventKind::StoreSuccess, Outcome::Success)
                        .document(self.document_id.as_str())
                        .user(user_id),
                );
            }
            Err(e) => {
                self.failed_flushes += 1;
                if self.is_retryable(e) {
                    self.scheduler.flush_failed(Instant::now());
                    log::warn!("Save of {} failed, will retry: {e}", self.document_id);
                } else {
                    self.scheduler.flush_abandoned();
                    log::error!("Save of {} failed, waiting for the next edit: {e}", self.document_id);
                }
                self.events.emit(
                    CollabEvent::new(EventKind::StoreFailure, Outcome::Failure(e.to_string()))
                        .document(self.document_id.as_str())
                        .user(user_id),
                );
            }
        }

        for waiter in self.inflight_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }

        if !self.pending_waiters.is_empty() {
            if self.scheduler.has_pending() {
                self.start_flush();
            } else {
                for waiter in self.pending_waiters.drain(..) {
                    let _ = waiter.send(result.clone());
                }
            }
        } else if result.is_ok() && self.closing.is_some() && self.scheduler.has_pending() {
            self.start_flush();
        }
    }

    fn is_retryable(&self, error: &PersistError) -> bool {
        match error {
            PersistError::Store(StoreError::Forbidden { .. }) => self.save_context().is_some(),
            PersistError::Store(_) => true,
            PersistError::Transform(_) | PersistError::NoWriter | PersistError::SessionClosed => false,
        }
    }

    /// Who saves: the latest editor, else the loading connection, else any
    /// connected peer, skipping users the store has refused.
    fn save_context(&self) -> Option<ConnectionContext> {
        self.last_editor
            .iter()
            .chain(std::iter::once(&self.loader))
            .chain(self.peers.values().map(|peer| &peer.context))
            .find(|ctx| !self.refused.contains(ctx.user_id()))
            .cloned()
    }

    fn save_user(&self) -> String {
        self.save_context()
            .unwrap_or_else(|| self.loader.clone())
            .user_id()
            .to_string()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
