//! Session Registry: document id → live session.
//!
//! Creation is single-flight: the first acquirer of an unseen id installs an
//! empty [`OnceCell`] and every concurrent acquirer awaits that same cell, so
//! the store is fetched once per session generation. When the last peer
//! releases, the entry turns `Closing` until the session's final flush is
//! done; acquirers arriving meanwhile wait for it and then start a fresh
//! generation.
//!
//! Only the loading peer's access is proven by the fetch. Every other peer
//! is checked with [`DocumentStore::authorize`] before it sees any state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use quill_core::{Replica, ReplicaTransform, TransformError};
use thiserror::Error;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::ConnectionContext;
use crate::config::ServerConfig;
use crate::events::{CollabEvent, EventKind, Events, Outcome};
use crate::session::{JoinAck, PeerConnection, SessionError, SessionHandle, SessionInit};
use crate::storage::{DocumentStore, StoreError};

/// Why a session started without its stored content.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("fetch failed: {0}")]
    Store(#[from] StoreError),
    #[error("stored content unusable: {0}")]
    Transform(#[from] TransformError),
}

enum Entry {
    Open {
        cell: Arc<OnceCell<SessionHandle>>,
        ref_count: usize,
    },
    Closing {
        done: watch::Receiver<bool>,
    },
}

enum Step {
    Ready(Arc<OnceCell<SessionHandle>>),
    Wait(watch::Receiver<bool>),
}

struct RegistryInner {
    entries: Mutex<HashMap<String, Entry>>,
    store: Arc<dyn DocumentStore>,
    transform: Arc<dyn ReplicaTransform>,
    events: Events,
    config: ServerConfig,
    shutting_down: AtomicBool,
}

impl RegistryInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One reference taken by an `acquire` still in progress. Dropped while
/// armed, as when the acquiring future is cancelled, it gives the reference
/// back.
struct Reference<'a> {
    registry: &'a SessionRegistry,
    document_id: &'a str,
    cell: Arc<OnceCell<SessionHandle>>,
    armed: bool,
}

impl Drop for Reference<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            log::warn!("Reference to {} dropped outside the runtime", self.document_id);
            return;
        }
        log::debug!("Acquire of {} cancelled, giving its reference back", self.document_id);
        let _ = self.registry.unref(self.document_id, &self.cell);
    }
}

/// Owned by the process, shared by every connection task.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        transform: Arc<dyn ReplicaTransform>,
        events: Events,
        config: ServerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                store,
                transform,
                events,
                config,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Join `peer` to the session for `document_id`, creating it if needed.
    ///
    /// Takes one reference on success; pair it with [`release`](Self::release).
    pub async fn acquire(
        &self,
        document_id: &str,
        peer: PeerConnection,
    ) -> Result<(SessionHandle, JoinAck), SessionError> {
        let cell = loop {
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Err(SessionError::ShuttingDown);
            }

            let step = {
                let mut entries = self.inner.entries();
                match entries.get_mut(document_id) {
                    Some(Entry::Open { cell, ref_count }) => {
                        *ref_count += 1;
                        Step::Ready(cell.clone())
                    }
                    Some(Entry::Closing { done }) => Step::Wait(done.clone()),
                    None => {
                        let cell = Arc::new(OnceCell::new());
                        entries.insert(
                            document_id.to_string(),
                            Entry::Open {
                                cell: cell.clone(),
                                ref_count: 1,
                            },
                        );
                        Step::Ready(cell)
                    }
                }
            };

            match step {
                Step::Ready(cell) => break cell,
                Step::Wait(mut done) => {
                    log::debug!("Waiting for previous session of {document_id} to close");
                    let _ = done.wait_for(|closed| *closed).await;
                }
            }
        };

        let mut reference = Reference {
            registry: self,
            document_id,
            cell: cell.clone(),
            armed: true,
        };

        let result = async {
            let mut loaded_here = false;
            let handle = cell
                .get_or_try_init(|| {
                    loaded_here = true;
                    self.load(document_id, &peer.context)
                })
                .await?
                .clone();
            if !loaded_here {
                self.authorize(document_id, &peer.context).await?;
            }
            let ack = handle.add_peer(peer).await?;
            Ok::<_, SessionError>((handle, ack))
        }
        .await;

        reference.armed = false;
        if result.is_err() {
            self.drop_ref(document_id, &cell).await;
        }
        result
    }

    /// Access check for a peer joining a session someone else loaded.
    async fn authorize(&self, document_id: &str, ctx: &ConnectionContext) -> Result<(), SessionError> {
        match self.inner.store.authorize(document_id, ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("User {} may not join {document_id}: {e}", ctx.user_id());
                self.inner.events.emit(
                    CollabEvent::new(EventKind::Load, Outcome::Failure("forbidden".into()))
                        .document(document_id)
                        .user(ctx.user_id()),
                );
                Err(SessionError::Forbidden(document_id.to_string()))
            }
        }
    }

    /// Remove `peer_id` and drop its reference. The last release flushes the
    /// session and removes it; this returns once that is done.
    pub async fn release(&self, document_id: &str, peer_id: Uuid) {
        let cell = match self.inner.entries().get(document_id) {
            Some(Entry::Open { cell, .. }) => cell.clone(),
            _ => return,
        };
        if let Some(handle) = cell.get() {
            if let Err(e) = handle.remove_peer(peer_id).await {
                log::warn!("Could not remove peer {peer_id} from {document_id}: {e}");
            }
        }
        self.drop_ref(document_id, &cell).await;
    }

    async fn drop_ref(&self, document_id: &str, cell: &Arc<OnceCell<SessionHandle>>) {
        if let Some(teardown) = self.unref(document_id, cell) {
            if let Err(e) = teardown.await {
                log::error!("Session teardown task failed: {e}");
            }
        }
    }

    /// Drop one reference; the last one starts the teardown task.
    fn unref(&self, document_id: &str, cell: &Arc<OnceCell<SessionHandle>>) -> Option<JoinHandle<()>> {
        let (handle, done) = {
            let mut entries = self.inner.entries();
            let Some(Entry::Open {
                cell: current,
                ref_count,
            }) = entries.get_mut(document_id)
            else {
                return None;
            };
            if !Arc::ptr_eq(current, cell) {
                return None;
            }
            *ref_count = ref_count.saturating_sub(1);
            if *ref_count > 0 {
                return None;
            }
            let Some(handle) = cell.get().cloned() else {
                entries.remove(document_id);
                return None;
            };
            let (done_tx, done_rx) = watch::channel(false);
            entries.insert(document_id.to_string(), Entry::Closing { done: done_rx });
            (handle, done_tx)
        };

        // Teardown runs on its own task so a cancelled caller cannot leave the
        // entry stuck in `Closing`.
        let inner = self.inner.clone();
        let document_id = document_id.to_string();
        Some(tokio::spawn(async move {
            log::debug!("Last peer left {document_id}, closing session");
            if let Err(e) = handle.close().await {
                log::warn!("Session {document_id} ended before its final flush: {e}");
            }
            let mut entries = inner.entries();
            if matches!(entries.get(&document_id), Some(Entry::Closing { .. })) {
                entries.remove(&document_id);
            }
            drop(entries);
            let _ = done.send(true);
        }))
    }

    async fn load(&self, document_id: &str, ctx: &ConnectionContext) -> Result<SessionHandle, SessionError> {
        let inner = &self.inner;
        let event = |outcome| {
            CollabEvent::new(EventKind::Load, outcome)
                .document(document_id)
                .user(ctx.user_id())
        };

        let (replica, degraded) = match inner.store.fetch(document_id, ctx).await {
            Ok(Some(representation)) => match inner.transform.to_replica(&representation) {
                Ok(replica) => {
                    inner.events.emit(event(Outcome::Success));
                    (replica, false)
                }
                Err(e) => {
                    let e = LoadError::from(e);
                    log::error!("Document {document_id} loaded empty: {e}");
                    inner.events.emit(event(Outcome::Degraded(e.to_string())));
                    (Replica::new(), true)
                }
            },
            Ok(None) => {
                inner.events.emit(event(Outcome::NotFound));
                (Replica::new(), false)
            }
            Err(StoreError::Forbidden { .. }) => {
                log::warn!("User {} may not open {document_id}", ctx.user_id());
                inner.events.emit(event(Outcome::Failure("forbidden".into())));
                return Err(SessionError::Forbidden(document_id.to_string()));
            }
            Err(e) => {
                let e = LoadError::from(e);
                log::error!("Document {document_id} loaded empty: {e}");
                inner.events.emit(event(Outcome::Degraded(e.to_string())));
                (Replica::new(), true)
            }
        };

        log::info!(
            "Session created for {document_id}{}",
            if degraded { " (degraded)" } else { "" }
        );
        Ok(SessionHandle::spawn(SessionInit {
            document_id: document_id.to_string(),
            replica,
            degraded,
            loader: ctx.clone(),
            store: inner.store.clone(),
            transform: inner.transform.clone(),
            events: inner.events.clone(),
            config: inner.config.session_config(),
        }))
    }

    /// Flush and close every live session, then refuse new acquisitions.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let (handles, closing): (Vec<SessionHandle>, Vec<watch::Receiver<bool>>) = {
            let entries = self.inner.entries();
            let mut handles = Vec::new();
            let mut closing = Vec::new();
            for entry in entries.values() {
                match entry {
                    Entry::Open { cell, .. } => handles.extend(cell.get().cloned()),
                    Entry::Closing { done } => closing.push(done.clone()),
                }
            }
            (handles, closing)
        };

        log::info!("Shutting down {} sessions", handles.len());
        let closes = handles.iter().map(|handle| async move {
            if let Err(e) = handle.close().await {
                log::warn!("Session {} ended before its final flush: {e}", handle.document_id());
            }
        });
        futures_util::future::join_all(closes).await;
        for mut done in closing {
            let _ = done.wait_for(|closed| *closed).await;
        }

        self.inner.entries().clear();
    }

    /// Live session for `document_id`, if any.
    pub fn get(&self, document_id: &str) -> Option<SessionHandle> {
        match self.inner.entries().get(document_id) {
            Some(Entry::Open { cell, .. }) => cell.get().cloned(),
            _ => None,
        }
    }

    /// Ids of documents with a live session, sorted.
    pub fn active_documents(&self) -> Vec<String> {
        let entries = self.inner.entries();
        let mut ids: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Open { cell, .. } if cell.initialized()))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.active_documents().len()
    }

    /// References held on `document_id`'s session.
    pub fn ref_count(&self, document_id: &str) -> usize {
        match self.inner.entries().get(document_id) {
            Some(Entry::Open { ref_count, .. }) => *ref_count,
            _ => 0,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }
}
