//! addrindex-storage — pluggable `IndexStore` backends.
//!
//! Backends:
//! - [`memory`] — in-memory set-backed store (dev/testing, no persistence)
//! - [`kv`] — ordered key-value adapter, with the in-process [`kv::BTreeKv`]
//! - [`sqlite`] — SQLite ordered key-value store via `sqlx` (single-file persistence)
//!
//! [`open_store`] picks one from a [`StorageConfig`] at startup.

pub mod kv;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use addrindex_core::codec::{KeyCodec, KeyFraming};
use addrindex_core::error::IndexerError;
use addrindex_core::store::{DuplicatePolicy, IndexStore};

pub use kv::{BTreeKv, KvIndexStore, OrderedKv};
pub use memory::InMemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteKv;

/// Which backend to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    /// Set-backed, in-memory.
    #[default]
    Memory,
    /// Ordered KV, in-memory.
    MemoryKv,
    /// Ordered KV in a SQLite file.
    Sqlite,
}

impl StorageBackend {
    /// Whether the data outlives the process.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Sqlite)
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::MemoryKv => write!(f, "memory-kv"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database path (sqlite only).
    pub path: Option<String>,
    /// Bucket prefix for the set-backed store.
    pub namespace: String,
    /// Edges per physical write batch (ordered KV only).
    pub batch_size: usize,
    pub key_framing: KeyFraming,
    /// Applied by every merge into the ordered-KV backends.
    pub duplicates: DuplicatePolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: None,
            namespace: "addrindex".into(),
            batch_size: kv::DEFAULT_WRITE_BATCH,
            key_framing: KeyFraming::default(),
            duplicates: DuplicatePolicy::default(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.batch_size == 0 {
            return Err(IndexerError::Config("storage batch_size must be at least 1".into()));
        }
        if self.backend == StorageBackend::Sqlite && self.path.is_none() {
            return Err(IndexerError::Config("sqlite backend needs a path".into()));
        }
        Ok(())
    }

    fn kv_store<K: OrderedKv>(&self, kv: K) -> KvIndexStore<K> {
        KvIndexStore::new(kv)
            .with_codec(KeyCodec::new(self.key_framing))
            .with_batch_size(self.batch_size)
            .with_duplicates(self.duplicates)
    }
}

/// Open the configured backend.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn IndexStore>, IndexerError> {
    config.validate()?;
    tracing::info!(backend = %config.backend, "opening store");
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryStorage::new(config.namespace.clone()))),
        StorageBackend::MemoryKv => Ok(Arc::new(config.kv_store(BTreeKv::new()))),
        StorageBackend::Sqlite => open_sqlite(config).await,
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(config: &StorageConfig) -> Result<Arc<dyn IndexStore>, IndexerError> {
    let path = config
        .path
        .as_deref()
        .ok_or_else(|| IndexerError::Config("sqlite backend needs a path".into()))?;
    let kv = SqliteKv::open(path).await?;
    Ok(Arc::new(config.kv_store(kv)))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_config: &StorageConfig) -> Result<Arc<dyn IndexStore>, IndexerError> {
    Err(IndexerError::Config(
        "built without the `sqlite` feature".into(),
    ))
}
