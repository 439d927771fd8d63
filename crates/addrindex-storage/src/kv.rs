//! Ordered key-value adapter.
//!
//! [`KvIndexStore`] maps the `IndexStore` contract onto any [`OrderedKv`]:
//! address entries become empty-valued keys built by [`KeyCodec`] in the
//! `addresses` namespace, and the watermark is a JSON record in the `state`
//! namespace. Keys may repeat; a scan returns equal keys in insertion order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use addrindex_core::codec::{EntryKey, KeyCodec};
use addrindex_core::error::IndexerError;
use addrindex_core::store::{DuplicatePolicy, IndexStore, WatermarkRecord, WATERMARK_KEY};
use addrindex_core::types::{Address, AddressEntries, AddressEntry};

/// Default number of edges per physical write batch.
pub const DEFAULT_WRITE_BATCH: usize = 150;

/// A key-value pair as stored.
pub type KvRow = (Vec<u8>, Vec<u8>);

/// An ordered store of binary keys (duplicates allowed) plus a small
/// textual state namespace.
#[async_trait]
pub trait OrderedKv: Send + Sync {
    /// Write all rows atomically: either every row lands or none does.
    async fn put_batch(&self, rows: Vec<KvRow>) -> Result<(), IndexerError>;

    /// Rows with `start <= key <= end`, in key order then insertion order.
    async fn scan(&self, start: &[u8], end: &[u8], limit: Option<usize>)
        -> Result<Vec<KvRow>, IndexerError>;

    /// Every row, in key order then insertion order.
    async fn scan_all(&self) -> Result<Vec<KvRow>, IndexerError>;

    async fn contains(&self, key: &[u8]) -> Result<bool, IndexerError>;

    async fn get_state(&self, key: &str) -> Result<Option<String>, IndexerError>;

    async fn put_state(&self, key: &str, value: &str) -> Result<(), IndexerError>;

    async fn close(&self) -> Result<(), IndexerError>;
}

// ─── KvIndexStore ────────────────────────────────────────────────────────────

/// `IndexStore` over an ordered key-value backend.
pub struct KvIndexStore<K> {
    kv: K,
    codec: KeyCodec,
    batch_size: usize,
    duplicates: DuplicatePolicy,
}

impl<K: OrderedKv> KvIndexStore<K> {
    pub fn new(kv: K) -> Self {
        Self {
            kv,
            codec: KeyCodec::default(),
            batch_size: DEFAULT_WRITE_BATCH,
            duplicates: DuplicatePolicy::default(),
        }
    }

    pub fn with_codec(mut self, codec: KeyCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Edges per physical write batch (minimum 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_duplicates(mut self, duplicates: DuplicatePolicy) -> Self {
        self.duplicates = duplicates;
        self
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// Encode every entry up front so a bad height fails before any write.
    async fn encode_entries(&self, entries: &AddressEntries) -> Result<Vec<Vec<u8>>, IndexerError> {
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for (address, update) in entries {
            for entry in update.entries() {
                let key = self.codec.encode(&EntryKey::new(*address, entry))?;
                if self.duplicates == DuplicatePolicy::SkipExisting
                    && (seen.contains(&key) || self.kv.contains(&key).await?)
                {
                    continue;
                }
                if self.duplicates == DuplicatePolicy::SkipExisting {
                    seen.insert(key.clone());
                }
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl<K: OrderedKv + 'static> IndexStore for KvIndexStore<K> {
    async fn get_watermark(&self) -> Result<Option<u64>, IndexerError> {
        match self.kv.get_state(WATERMARK_KEY).await? {
            Some(raw) => {
                let record: WatermarkRecord = serde_json::from_str(&raw)?;
                Ok(Some(record.block_number))
            }
            None => Ok(None),
        }
    }

    async fn set_watermark(&self, height: u64) -> Result<(), IndexerError> {
        let raw = serde_json::to_string(&WatermarkRecord::now(height))?;
        self.kv.put_state(WATERMARK_KEY, &raw).await
    }

    async fn merge_address_entries(&self, entries: &AddressEntries) -> Result<usize, IndexerError> {
        let keys = self.encode_entries(entries).await?;
        let written = keys.len();
        let mut batches = 0usize;
        for chunk in keys.chunks(self.batch_size) {
            let rows = chunk.iter().map(|k| (k.clone(), Vec::new())).collect();
            self.kv.put_batch(rows).await?;
            batches += 1;
        }
        debug!(addresses = entries.len(), written, batches, "merged address entries");
        Ok(written)
    }

    async fn lookup_address(
        &self,
        address: &Address,
        from_height: u64,
        limit: Option<usize>,
    ) -> Result<Vec<AddressEntry>, IndexerError> {
        if limit == Some(0) {
            return Ok(vec![]);
        }
        let (start, end) = self.codec.range(address, from_height, u64::MAX)?;
        self.kv
            .scan(&start, &end, limit)
            .await?
            .into_iter()
            .map(|(key, _)| self.codec.decode(&key).map(EntryKey::into_entry))
            .collect()
    }

    async fn dump(&self) -> Result<Vec<(Address, AddressEntry)>, IndexerError> {
        self.kv
            .scan_all()
            .await?
            .into_iter()
            .map(|(key, _)| -> Result<_, IndexerError> {
                let key = self.codec.decode(&key)?;
                Ok((key.address, key.into_entry()))
            })
            .collect()
    }

    async fn close(&self) -> Result<(), IndexerError> {
        self.kv.close().await
    }
}

// ─── BTreeKv ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct BTreeInner {
    /// `(key, insertion sequence) → value`; the sequence keeps duplicate keys.
    rows: BTreeMap<(Vec<u8>, u64), Vec<u8>>,
    next_seq: u64,
    state: HashMap<String, String>,
}

/// In-process ordered multimap. Nothing survives the process.
#[derive(Default)]
pub struct BTreeKv {
    inner: Mutex<BTreeInner>,
}

impl BTreeKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows, duplicates included.
    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BTreeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OrderedKv for BTreeKv {
    async fn put_batch(&self, rows: Vec<KvRow>) -> Result<(), IndexerError> {
        let mut inner = self.lock();
        for (key, value) in rows {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.rows.insert((key, seq), value);
        }
        Ok(())
    }

    async fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<KvRow>, IndexerError> {
        if start > end {
            return Ok(vec![]);
        }
        let inner = self.lock();
        let range = inner
            .rows
            .range((start.to_vec(), 0)..=(end.to_vec(), u64::MAX))
            .map(|((key, _), value)| (key.clone(), value.clone()));
        Ok(match limit {
            Some(n) => range.take(n).collect(),
            None => range.collect(),
        })
    }

    async fn scan_all(&self) -> Result<Vec<KvRow>, IndexerError> {
        let inner = self.lock();
        Ok(inner
            .rows
            .iter()
            .map(|((key, _), value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn contains(&self, key: &[u8]) -> Result<bool, IndexerError> {
        let inner = self.lock();
        let found = inner
            .rows
            .range((key.to_vec(), 0)..=(key.to_vec(), u64::MAX))
            .next()
            .is_some();
        Ok(found)
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>, IndexerError> {
        Ok(self.lock().state.get(key).cloned())
    }

    async fn put_state(&self, key: &str, value: &str) -> Result<(), IndexerError> {
        self.lock().state.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), IndexerError> {
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
