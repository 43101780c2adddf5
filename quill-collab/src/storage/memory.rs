//! In-process document store.
//!
//! Used when no storage path is configured, and by tests: it counts calls,
//! records every save and can be told to fail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use quill_core::Representation;
use tokio::time::Instant;

use super::{DocumentStore, StoreError};
use crate::auth::ConnectionContext;

#[derive(Debug, Clone)]
struct StoredDocument {
    owner: String,
    collaborators: HashSet<String>,
    content: Representation,
}

impl StoredDocument {
    fn allows(&self, user_id: &str) -> bool {
        self.owner == user_id || self.collaborators.contains(user_id)
    }
}

/// One successful save.
#[derive(Debug, Clone)]
pub struct SaveRecord {
    pub document_id: String,
    pub user_id: String,
    pub representation: Representation,
    pub at: Instant,
}

#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, StoredDocument>>,
    save_log: Mutex<Vec<SaveRecord>>,
    fetches: AtomicUsize,
    save_attempts: AtomicUsize,
    fail_fetches: AtomicBool,
    failing_saves: AtomicUsize,
    fetch_delay: Mutex<Option<Duration>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document owned by `owner`.
    pub fn insert(&self, document_id: impl Into<String>, owner: impl Into<String>, content: Representation) {
        lock(&self.documents).insert(
            document_id.into(),
            StoredDocument {
                owner: owner.into(),
                collaborators: HashSet::new(),
                content,
            },
        );
    }

    /// Grant `user_id` access to an existing document.
    pub fn share(&self, document_id: &str, user_id: impl Into<String>) -> bool {
        match lock(&self.documents).get_mut(document_id) {
            Some(doc) => {
                doc.collaborators.insert(user_id.into());
                true
            }
            None => false,
        }
    }

    /// Current stored content, bypassing access control.
    pub fn get(&self, document_id: &str) -> Option<Representation> {
        lock(&self.documents).get(document_id).map(|d| d.content.clone())
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Saves attempted, including failed ones.
    pub fn save_attempts(&self) -> usize {
        self.save_attempts.load(Ordering::SeqCst)
    }

    /// Successful saves, oldest first.
    pub fn saves(&self) -> Vec<SaveRecord> {
        lock(&self.save_log).clone()
    }

    pub fn saves_for(&self, document_id: &str) -> Vec<SaveRecord> {
        lock(&self.save_log)
            .iter()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect()
    }

    /// Make every fetch fail with `Unavailable` until reset.
    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` saves fail with `Unavailable`.
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Delay every fetch, widening the window for concurrent joins.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *lock(&self.fetch_delay) = delay;
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn fetch(
        &self,
        document_id: &str,
        ctx: &ConnectionContext,
    ) -> Result<Option<Representation>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.fetch_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("fetch failure injected".into()));
        }

        let documents = lock(&self.documents);
        match documents.get(document_id) {
            None => Ok(None),
            Some(doc) if doc.allows(ctx.user_id()) => Ok(Some(doc.content.clone())),
            Some(_) => Err(StoreError::Forbidden {
                document_id: document_id.to_string(),
                user_id: ctx.user_id().to_string(),
            }),
        }
    }

    async fn save(
        &self,
        document_id: &str,
        ctx: &ConnectionContext,
        representation: &Representation,
    ) -> Result<(), StoreError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("save failure injected".into()));
        }

        {
            let mut documents = lock(&self.documents);
            match documents.get_mut(document_id) {
                Some(doc) if doc.allows(ctx.user_id()) => doc.content = representation.clone(),
                Some(_) => {
                    return Err(StoreError::Forbidden {
                        document_id: document_id.to_string(),
                        user_id: ctx.user_id().to_string(),
                    })
                }
                None => {
                    documents.insert(
                        document_id.to_string(),
                        StoredDocument {
                            owner: ctx.user_id().to_string(),
                            collaborators: HashSet::new(),
                            content: representation.clone(),
                        },
                    );
                }
            }
        }

        lock(&self.save_log).push(SaveRecord {
            document_id: document_id.to_string(),
            user_id: ctx.user_id().to_string(),
            representation: representation.clone(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn authorize(&self, document_id: &str, ctx: &ConnectionContext) -> Result<(), StoreError> {
        match lock(&self.documents).get(document_id) {
            Some(doc) if !doc.allows(ctx.user_id()) => Err(StoreError::Forbidden {
                document_id: document_id.to_string(),
                user_id: ctx.user_id().to_string(),
            }),
            _ => Ok(()),
        }
    }
}
