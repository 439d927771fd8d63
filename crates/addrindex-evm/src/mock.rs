//! Scripted node and store wrappers for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use addrindex_core::error::IndexerError;
use addrindex_core::indexer::IndexerConfig;
use addrindex_core::retry::RetryConfig;
use addrindex_core::store::IndexStore;
use addrindex_core::types::{Address, AddressEntries, AddressEntry, Block, TxHash};

use crate::client::{HeaderStream, NewHeader, NodeClient};

/// Millisecond backoffs and polling, no confirmation margin.
pub fn fast_config() -> IndexerConfig {
    IndexerConfig {
        network: "private".into(),
        confirmation_depth: 0,
        prefetch_window: 20,
        poll_interval_ms: 10,
        retry: RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            jitter_fraction: 0.0,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A node whose chain is scripted by the test. Blocks not explicitly
/// inserted are empty; blocks above the tip are `NotFound`.
pub struct MockNode {
    network_id: u64,
    tip: AtomicU64,
    blocks: Mutex<HashMap<u64, Block>>,
    failures: Mutex<HashMap<u64, (u32, IndexerError)>>,
    attempts: Mutex<HashMap<u64, u32>>,
    headers: Mutex<Option<mpsc::UnboundedReceiver<NewHeader>>>,
}

impl MockNode {
    pub fn new(tip: u64) -> Self {
        Self {
            network_id: 1337,
            tip: AtomicU64::new(tip),
            blocks: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            headers: Mutex::new(None),
        }
    }

    pub fn with_network_id(mut self, id: u64) -> Self {
        self.network_id = id;
        self
    }

    pub fn set_tip(&self, tip: u64) {
        self.tip.store(tip, Ordering::SeqCst);
    }

    pub fn insert_block(&self, block: Block) {
        self.blocks.lock().unwrap().insert(block.number, block);
    }

    /// Fail the next `times` fetches of block `number` with `err`.
    pub fn fail(&self, number: u64, times: u32, err: IndexerError) {
        self.failures.lock().unwrap().insert(number, (times, err));
    }

    pub fn attempts(&self, number: u64) -> u32 {
        self.attempts.lock().unwrap().get(&number).copied().unwrap_or(0)
    }

    /// Enable the header subscription; returns the sending side.
    pub fn header_sender(&self) -> mpsc::UnboundedSender<NewHeader> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.headers.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn network_id(&self) -> Result<u64, IndexerError> {
        Ok(self.network_id)
    }

    async fn current_height(&self) -> Result<u64, IndexerError> {
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn get_block(&self, number: u64) -> Result<Block, IndexerError> {
        *self.attempts.lock().unwrap().entry(number).or_default() += 1;
        if let Some((remaining, err)) = self.failures.lock().unwrap().get_mut(&number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(err.clone());
            }
        }
        if number > self.tip.load(Ordering::SeqCst) {
            return Err(IndexerError::NotFound(format!("block {number}")));
        }
        let block = self.blocks.lock().unwrap().get(&number).cloned();
        Ok(block.unwrap_or_else(|| Block::empty(number)))
    }

    async fn subscribe_new_headers(&self) -> Result<Option<HeaderStream>, IndexerError> {
        let Some(rx) = self.headers.lock().unwrap().take() else {
            return Ok(None);
        };
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|header| (Ok(header), rx))
        });
        Ok(Some(stream.boxed()))
    }

    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<Value>, IndexerError> {
        let blocks = self.blocks.lock().unwrap();
        let found = blocks
            .values()
            .flat_map(|b| b.transactions.iter())
            .find(|tx| &tx.hash == hash)
            .map(|tx| json!({ "hash": tx.hash.to_prefixed(), "blockNumber": tx.block_number }));
        Ok(found)
    }

    async fn get_balance(&self, _address: &Address) -> Result<u128, IndexerError> {
        Ok(1_000_000_000_000_000_000)
    }

    async fn send_raw_transaction(&self, _raw: &str) -> Result<TxHash, IndexerError> {
        TxHash::from_slice(&[0xee; 32])
    }
}

/// Store wrapper that counts merges and can be told to fail them.
pub struct CountingStore {
    inner: Arc<dyn IndexStore>,
    merges: AtomicUsize,
    fail_merges: std::sync::atomic::AtomicBool,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn IndexStore>) -> Self {
        Self {
            inner,
            merges: AtomicUsize::new(0),
            fail_merges: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn merges(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }

    pub fn fail_merges(&self) {
        self.fail_merges.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexStore for CountingStore {
    async fn get_watermark(&self) -> Result<Option<u64>, IndexerError> {
        self.inner.get_watermark().await
    }

    async fn set_watermark(&self, height: u64) -> Result<(), IndexerError> {
        self.inner.set_watermark(height).await
    }

    async fn merge_address_entries(&self, entries: &AddressEntries) -> Result<usize, IndexerError> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        if self.fail_merges.load(Ordering::SeqCst) {
            return Err(IndexerError::Storage("disk full".into()));
        }
        self.inner.merge_address_entries(entries).await
    }

    async fn lookup_address(
        &self,
        address: &Address,
        from_height: u64,
        limit: Option<usize>,
    ) -> Result<Vec<AddressEntry>, IndexerError> {
        self.inner.lookup_address(address, from_height, limit).await
    }

    async fn close(&self) -> Result<(), IndexerError> {
        self.inner.close().await
    }
}
