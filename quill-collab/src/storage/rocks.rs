//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: persisted representation (JSON, LZ4 compressed)
//! - `metadata` : access list, version and sizes (bincode)
//!
//! Both are written in one `WriteBatch`, so a reader never sees content
//! without matching metadata. RocksDB calls block, so the async
//! [`DocumentStore`] impl runs them on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use quill_core::Representation;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{DocumentStore, StoreError};
use crate::auth::ConnectionContext;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, saves are infrequent)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Metadata stored alongside each document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub document_id: String,
    pub owner: String,
    pub collaborators: Vec<String>,
    /// Incremented on every save
    pub version: u64,
    /// Uncompressed JSON size in bytes
    pub content_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
    /// Last user to save
    pub updated_by: String,
}

impl DocumentMetadata {
    fn new(document_id: &str, owner: &str) -> Self {
        let now = unix_now();
        Self {
            document_id: document_id.to_string(),
            owner: owner.to_string(),
            collaborators: Vec::new(),
            version: 0,
            content_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
            updated_by: owner.to_string(),
        }
    }

    pub fn allows(&self, user_id: &str) -> bool {
        self.owner == user_id || self.collaborators.iter().any(|c| c == user_id)
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(meta)
    }
}

struct RocksInner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

/// RocksDB-backed document store. Cheap to clone.
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<RocksInner>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(RocksInner { db, config }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Stored content for `document_id`, without access checks.
    pub fn load_document(&self, document_id: &str) -> Result<Option<Representation>, StoreError> {
        self.inner.load_document(document_id)
    }

    pub fn load_metadata(&self, document_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        self.inner.load_metadata(document_id)
    }

    /// Write `representation` as `user_id`, creating the document if needed.
    pub fn save_document(
        &self,
        document_id: &str,
        user_id: &str,
        representation: &Representation,
    ) -> Result<DocumentMetadata, StoreError> {
        self.inner.save_document(document_id, user_id, representation)
    }

    /// Add a collaborator to an existing document.
    pub fn share(&self, document_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let inner = &self.inner;
        let Some(mut meta) = inner.load_metadata(document_id)? else {
            return Ok(false);
        };
        if !meta.allows(user_id) {
            meta.collaborators.push(user_id.to_string());
            inner.db.put_cf(inner.cf(CF_METADATA)?, document_id.as_bytes(), meta.encode()?)?;
        }
        Ok(true)
    }

    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let inner = &self.inner;
        let cf = inner.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in inner.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Corrupt("non UTF-8 document key".into()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let inner = &self.inner;
        let mut batch = WriteBatch::default();
        batch.delete_cf(inner.cf(CF_DOCUMENTS)?, document_id.as_bytes());
        batch.delete_cf(inner.cf(CF_METADATA)?, document_id.as_bytes());
        inner.db.write(batch)?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksInner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

impl RocksInner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn load_metadata(&self, document_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        match self.db.get_cf(self.cf(CF_METADATA)?, document_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn load_document(&self, document_id: &str) -> Result<Option<Representation>, StoreError> {
        let Some(compressed) = self.db.get_cf(self.cf(CF_DOCUMENTS)?, document_id.as_bytes())? else {
            return Ok(None);
        };
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        serde_json::from_slice(&json)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn save_document(
        &self,
        document_id: &str,
        user_id: &str,
        representation: &Representation,
    ) -> Result<DocumentMetadata, StoreError> {
        let json = serde_json::to_vec(representation).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = match self.load_metadata(document_id)? {
            Some(meta) if !meta.allows(user_id) => {
                return Err(StoreError::Forbidden {
                    document_id: document_id.to_string(),
                    user_id: user_id.to_string(),
                })
            }
            Some(meta) => meta,
            None => DocumentMetadata::new(document_id, user_id),
        };
        meta.version += 1;
        meta.content_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();
        meta.updated_by = user_id.to_string();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, document_id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, document_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn fetch(
        &self,
        document_id: &str,
        ctx: &ConnectionContext,
    ) -> Result<Option<Representation>, StoreError> {
        let document_id = document_id.to_string();
        let user_id = ctx.user_id().to_string();
        self.blocking(move |inner| {
            match inner.load_metadata(&document_id)? {
                None => return Ok(None),
                Some(meta) if !meta.allows(&user_id) => {
                    return Err(StoreError::Forbidden { document_id, user_id })
                }
                Some(_) => {}
            }
            inner.load_document(&document_id)
        })
        .await
    }

    async fn save(
        &self,
        document_id: &str,
        ctx: &ConnectionContext,
        representation: &Representation,
    ) -> Result<(), StoreError> {
        let document_id = document_id.to_string();
        let user_id = ctx.user_id().to_string();
        let representation = representation.clone();
        let meta = self
            .blocking(move |inner| inner.save_document(&document_id, &user_id, &representation))
            .await?;
        log::debug!(
            "Saved {} v{} ({} -> {} bytes)",
            meta.document_id,
            meta.version,
            meta.content_size,
            meta.compressed_size
        );
        Ok(())
    }

    async fn authorize(&self, document_id: &str, ctx: &ConnectionContext) -> Result<(), StoreError> {
        let document_id = document_id.to_string();
        let user_id = ctx.user_id().to_string();
        self.blocking(move |inner| match inner.load_metadata(&document_id)? {
            Some(meta) if !meta.allows(&user_id) => Err(StoreError::Forbidden { document_id, user_id }),
            _ => Ok(()),
        })
        .await
    }
}

fn cf_options(config: &StoreConfig) -> Options {
    let mut opts = Options::default();

    let mut block_opts = BlockBasedOptions::default();
    let cache = Cache::new_lru_cache(config.block_cache_size);
    block_opts.set_block_cache(&cache);
    block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
    opts.set_block_based_table_factory(&block_opts);

    // Values are already LZ4-framed.
    opts.set_compression_type(DBCompressionType::None);
    opts.set_max_write_buffer_number(2);
    opts.optimize_for_point_lookup(config.block_cache_size as u64);
    opts
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
