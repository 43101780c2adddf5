//! # quill-collab: Real-time collaboration server for Quill documents
//!
//! Peers connect over WebSocket, authenticate, and edit a shared document
//! replica. Edits are merged by one actor per document, fanned out to the
//! other peers, and saved to a [`DocumentStore`] after a quiet period.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄────────────────► │ SyncServer   │── AuthGate ── IdentityVerifier
//! │ (per user)   │    Binary Proto    │ (gateway)    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │ acquire / release
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ Replica      │                    │ Session      │── fetch ──► DocumentStore
//! │ (local)      │                    │ Registry     │
//! └──────────────┘                    └──────┬───────┘
//!                                            │ one per document
//!                                     ┌──────┴───────┐
//!                                     │ Session actor│── save (debounced)
//!                                     │ + fan-out    │
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`auth`]: Auth Gate, connection context, JWT and static verifiers
//! - [`storage`]: Document Store trait, in-memory and RocksDB stores
//! - [`scheduler`]: Debounce / max-debounce save scheduling
//! - [`broadcast`]: Per-session fan-out with lag detection
//! - [`session`]: Replica Session actor
//! - [`registry`]: Single-flight session registry
//! - [`server`]: WebSocket gateway
//! - [`client`]: WebSocket client
//! - [`events`]: Observability events and counters

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{
    issue_token, AuthError, AuthGate, ConnectionContext, Identity, IdentityVerifier, JwtVerifier, StaticVerifier,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Feed, PeerFeed};
pub use client::{ClientError, ClientEvent, CollabClient};
pub use config::{ConfigError, ServerConfig};
pub use error::CollabError;
pub use events::{CollabEvent, EventKind, EventSink, Events, LogSink, MemorySink, Outcome, ServerStats};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage, Welcome};
pub use registry::{LoadError, SessionRegistry};
pub use scheduler::DebounceScheduler;
pub use server::SyncServer;
pub use session::{JoinAck, PeerConnection, PersistError, SessionConfig, SessionError, SessionHandle, SessionSnapshot};
pub use storage::{DocumentMetadata, DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};
