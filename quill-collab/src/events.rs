//! Observability events and server counters.
//!
//! Every connect, disconnect, load, save and auth failure produces one
//! [`CollabEvent`]. Events update the lock-free counters behind
//! [`ServerStats`] and are then handed to the configured [`EventSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use uuid::Uuid;

/// Target used by [`LogSink`].
pub const EVENT_LOG_TARGET: &str = "quill::events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Load,
    StoreSuccess,
    StoreFailure,
    AuthFailure,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Load => "load",
            EventKind::StoreSuccess => "store-success",
            EventKind::StoreFailure => "store-failure",
            EventKind::AuthFailure => "auth-failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Load found no stored document
    NotFound,
    /// Load failed, session started empty
    Degraded(String),
    Failure(String),
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::NotFound => write!(f, "not-found"),
            Outcome::Degraded(reason) => write!(f, "degraded ({reason})"),
            Outcome::Failure(reason) => write!(f, "failure ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollabEvent {
    pub kind: EventKind,
    pub document_id: Option<String>,
    pub peer_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub at: SystemTime,
    pub outcome: Outcome,
}

impl CollabEvent {
    pub fn new(kind: EventKind, outcome: Outcome) -> Self {
        Self {
            kind,
            document_id: None,
            peer_id: None,
            user_id: None,
            at: SystemTime::now(),
            outcome,
        }
    }

    pub fn document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn peer(mut self, peer_id: Uuid) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Receives observability events. Must not block.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &CollabEvent);
}

/// Writes one log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&self, event: &CollabEvent) {
        let level = match (&event.kind, &event.outcome) {
            (EventKind::StoreFailure, _) | (_, Outcome::Degraded(_)) => log::Level::Warn,
            (EventKind::AuthFailure, _) => log::Level::Info,
            _ => log::Level::Debug,
        };
        log::log!(
            target: EVENT_LOG_TARGET,
            level,
            "event={} doc={} peer={} user={} outcome={}",
            event.kind.as_str(),
            event.document_id.as_deref().unwrap_or("-"),
            event.peer_id.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            event.user_id.as_deref().unwrap_or("-"),
            event.outcome,
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<CollabEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CollabEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &CollabEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Server statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub auth_failures: u64,
    pub loads: u64,
    pub degraded_loads: u64,
    pub saves: u64,
    pub save_failures: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

/// Atomic counters, lock-free on the hot path.
#[derive(Debug, Default)]
struct AtomicStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    auth_failures: AtomicU64,
    loads: AtomicU64,
    degraded_loads: AtomicU64,
    saves: AtomicU64,
    save_failures: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Event fan-in shared by the gateway, registry and sessions.
#[derive(Clone)]
pub struct Events {
    sink: Arc<dyn EventSink>,
    stats: Arc<AtomicStats>,
}

impl Events {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            stats: Arc::new(AtomicStats::default()),
        }
    }

    pub fn emit(&self, event: CollabEvent) {
        let s = &self.stats;
        match event.kind {
            EventKind::Connect => {
                s.total_connections.fetch_add(1, Ordering::Relaxed);
                s.active_connections.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::Disconnect => {
                let _ = s
                    .active_connections
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            }
            EventKind::Load => {
                s.loads.fetch_add(1, Ordering::Relaxed);
                if matches!(event.outcome, Outcome::Degraded(_)) {
                    s.degraded_loads.fetch_add(1, Ordering::Relaxed);
                }
            }
            EventKind::StoreSuccess => {
                s.saves.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::StoreFailure => {
                s.save_failures.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::AuthFailure => {
                s.auth_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sink.record(&event);
    }

    /// Count one inbound frame.
    pub fn record_message(&self, bytes: usize) {
        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
        self.stats.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counter snapshot; `active_sessions` is filled in by the caller.
    pub fn snapshot(&self) -> ServerStats {
        let s = &self.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            auth_failures: s.auth_failures.load(Ordering::Relaxed),
            loads: s.loads.load(Ordering::Relaxed),
            degraded_loads: s.degraded_loads.load(Ordering::Relaxed),
            saves: s.saves.load(Ordering::Relaxed),
            save_failures: s.save_failures.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            active_sessions: 0,
        }
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}
