//! Document Store: where persisted representations live.
//!
//! ```text
//! ┌───────────────┐   fetch on first join   ┌──────────────────┐
//! │ SessionRegistry│ ──────────────────────► │ DocumentStore     │
//! └───────────────┘                          │  ├─ MemoryStore   │
//! ┌───────────────┐   save on debounce       │  └─ RocksStore    │
//! │ ReplicaSession │ ──────────────────────► │     (RocksDB+LZ4) │
//! └───────────────┘                          └──────────────────┘
//! ```
//!
//! Every call is scoped by the caller's [`ConnectionContext`]; stores decide
//! access on the user id it carries.

use async_trait::async_trait;
use quill_core::Representation;
use thiserror::Error;

use crate::auth::ConnectionContext;

pub mod memory;
pub mod rocks;

pub use memory::{MemoryStore, SaveRecord};
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("User {user_id} may not access document {document_id}")]
    Forbidden { document_id: String, user_id: String },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Stored document is corrupt: {0}")]
    Corrupt(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persisted document storage, scoped by identity.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `Ok(None)` when the document has never been saved.
    async fn fetch(
        &self,
        document_id: &str,
        ctx: &ConnectionContext,
    ) -> Result<Option<Representation>, StoreError>;

    async fn save(
        &self,
        document_id: &str,
        ctx: &ConnectionContext,
        representation: &Representation,
    ) -> Result<(), StoreError>;

    /// Whether `ctx` may open `document_id`, without reading its content.
    /// A document that has never been saved is open to everyone.
    async fn authorize(&self, document_id: &str, ctx: &ConnectionContext) -> Result<(), StoreError>;
}
