//! In-memory set-backed storage.
//!
//! One membership set per `namespace:address` bucket. Members are rows
//! encoded with [`KeyCodec::encode_row`], so merging an entry that is
//! already present is a no-op. There is no range scan: `lookup_address`
//! decodes the whole bucket and filters. Useful for tests and short-lived
//! indexers; nothing survives the process.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use addrindex_core::codec::KeyCodec;
use addrindex_core::error::IndexerError;
use addrindex_core::store::{IndexStore, WatermarkRecord, WATERMARK_KEY};
use addrindex_core::types::{Address, AddressEntries, AddressEntry};

/// Members of one bucket, in insertion order.
#[derive(Default)]
struct Bucket {
    order: Vec<Vec<u8>>,
    members: HashSet<Vec<u8>>,
}

impl Bucket {
    fn insert(&mut self, row: Vec<u8>) -> bool {
        if self.members.insert(row.clone()) {
            self.order.push(row);
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, Bucket>,
    /// Bucket keys in creation order, for `dump`.
    bucket_order: Vec<(String, Address)>,
    state: HashMap<String, WatermarkRecord>,
}

/// In-memory, set-backed `IndexStore`.
pub struct InMemoryStorage {
    namespace: String,
    inner: Mutex<Inner>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new("addrindex")
    }
}

impl InMemoryStorage {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn bucket_key(&self, address: &Address) -> String {
        format!("{}:{address}", self.namespace)
    }

    fn state_key(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of distinct entries stored for `address`.
    pub fn member_count(&self, address: &Address) -> usize {
        self.lock()
            .buckets
            .get(&self.bucket_key(address))
            .map_or(0, |b| b.order.len())
    }
}

#[async_trait]
impl IndexStore for InMemoryStorage {
    async fn get_watermark(&self) -> Result<Option<u64>, IndexerError> {
        let key = self.state_key(WATERMARK_KEY);
        Ok(self.lock().state.get(&key).map(|r| r.block_number))
    }

    async fn set_watermark(&self, height: u64) -> Result<(), IndexerError> {
        let key = self.state_key(WATERMARK_KEY);
        self.lock().state.insert(key, WatermarkRecord::now(height));
        Ok(())
    }

    async fn merge_address_entries(&self, entries: &AddressEntries) -> Result<usize, IndexerError> {
        let mut rows = Vec::with_capacity(entries.len());
        for (address, update) in entries {
            let encoded = update
                .entries()
                .map(KeyCodec::encode_row)
                .collect::<Result<Vec<_>, _>>()?;
            rows.push((*address, self.bucket_key(address), encoded));
        }

        let mut inner = self.lock();
        let mut added = 0;
        for (address, key, encoded) in rows {
            if !inner.buckets.contains_key(&key) {
                inner.bucket_order.push((key.clone(), address));
            }
            let bucket = inner.buckets.entry(key).or_default();
            added += encoded.into_iter().filter(|row| bucket.insert(row.clone())).count();
        }
        Ok(added)
    }

    async fn lookup_address(
        &self,
        address: &Address,
        from_height: u64,
        limit: Option<usize>,
    ) -> Result<Vec<AddressEntry>, IndexerError> {
        let rows = match self.lock().buckets.get(&self.bucket_key(address)) {
            Some(bucket) => bucket.order.clone(),
            None => return Ok(vec![]),
        };

        let mut found = Vec::new();
        for row in &rows {
            let entry = KeyCodec::decode_row(row)?;
            if entry.block_number >= from_height {
                found.push(entry);
            }
        }
        // Stable: insertion order survives within one height.
        found.sort_by_key(|e| e.block_number);
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn dump(&self) -> Result<Vec<(Address, AddressEntry)>, IndexerError> {
        let inner = self.lock();
        let mut all = Vec::new();
        for (key, address) in &inner.bucket_order {
            if let Some(bucket) = inner.buckets.get(key) {
                for row in &bucket.order {
                    all.push((*address, KeyCodec::decode_row(row)?));
                }
            }
        }
        Ok(all)
    }

    async fn close(&self) -> Result<(), IndexerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use addrindex_core::types::{Direction, TxHash};

    fn transfer(from: u8, to: u8, hash: u8, block: u64) -> AddressEntries {
        let hash = TxHash::from_slice(&[hash; 32]).unwrap();
        let mut entries = AddressEntries::new();
        entries
            .entry(Address([from; 20]))
            .or_default()
            .push(AddressEntry::new(hash.clone(), block, Direction::Outbound));
        entries
            .entry(Address([to; 20]))
            .or_default()
            .push(AddressEntry::new(hash, block, Direction::Inbound));
        entries
    }

    #[tokio::test]
    async fn set_semantics_absorb_remerge() {
        let store = InMemoryStorage::default();
        let batch = transfer(0xa, 0xb, 1, 5);
        assert_eq!(store.merge_address_entries(&batch).await.unwrap(), 2);
        assert_eq!(store.merge_address_entries(&batch).await.unwrap(), 0);
        assert_eq!(store.member_count(&Address([0xa; 20])), 1);
    }

    #[tokio::test]
    async fn lookup_scans_and_filters() {
        let store = InMemoryStorage::default();
        for (hash, block) in [(1u8, 9u64), (2, 1), (3, 5)] {
            store
                .merge_address_entries(&transfer(0xa, 0xb, hash, block))
                .await
                .unwrap();
        }
        let heights: Vec<u64> = store
            .lookup_address(&Address([0xb; 20]), 5, None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.block_number)
            .collect();
        assert_eq!(heights, vec![5, 9]);

        let first = store.lookup_address(&Address([0xa; 20]), 0, Some(1)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].block_number, 1);
        assert!(!first[0].inbound);

        assert!(store.lookup_address(&Address([0xc; 20]), 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let store = InMemoryStorage::new("goerli");
        store.set_watermark(42).await.unwrap();
        assert_eq!(store.get_watermark().await.unwrap(), Some(42));
        assert_eq!(store.bucket_key(&Address([1; 20])), format!("goerli:{}", "01".repeat(20)));
    }

    #[tokio::test]
    async fn dump_in_bucket_order() {
        let store = InMemoryStorage::default();
        store.merge_address_entries(&transfer(0xa, 0xb, 1, 1)).await.unwrap();
        let all = store.dump().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|(a, e)| *a == Address([0xb; 20]) && e.inbound));
    }
}
