//! The index engine: drains the block source into the store.
//!
//! # Loop
//! 1. Wait for the next batch of confirmed blocks from [`BlockSource`].
//! 2. Check it starts at `watermark + 1` and has no gaps.
//! 3. Extract transfer edges and merge them (skipped when there are none).
//! 4. Persist the watermark at the batch's last block, then advance.
//! 5. Emit `BlockIndexed` for every block in the batch.
//!
//! Any error halts the loop in `Crashed` without moving the watermark, so the
//! failed batch is replayed after a restart. Replays may append duplicate
//! entries; see [`DuplicatePolicy`](addrindex_core::store::DuplicatePolicy).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use addrindex_core::cursor::Cursor;
use addrindex_core::error::IndexerError;
use addrindex_core::event::{EventBus, IndexEvent};
use addrindex_core::extract::extract_transfers;
use addrindex_core::indexer::{IndexerConfig, IndexerState};
use addrindex_core::store::IndexStore;
use addrindex_core::types::{entry_count, Block};

use crate::source::BlockSource;

/// Window over which indexing throughput is averaged and logged.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(10);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Blocks-per-second meter, reset every window.
struct Throughput {
    window_start: Instant,
    blocks: u64,
}

impl Throughput {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            blocks: 0,
        }
    }

    fn record(&mut self, blocks: u64, watermark: u64) {
        self.blocks += blocks;
        let elapsed = self.window_start.elapsed();
        if elapsed >= THROUGHPUT_WINDOW {
            let rate = self.blocks as f64 / elapsed.as_secs_f64();
            info!(blocks_per_sec = %format_args!("{rate:.2}"), watermark, "indexing throughput");
            *self = Self::new();
        }
    }
}

/// Turns ordered block batches into durable per-address entries.
pub struct IndexEngine {
    source: Arc<BlockSource>,
    store: Arc<dyn IndexStore>,
    batch_size: u64,
    confirmation_depth: u64,
    cursor: Mutex<Cursor>,
    state: Mutex<IndexerState>,
    stop: Mutex<CancellationToken>,
    events: EventBus,
}

impl IndexEngine {
    /// `cursor` is the store's watermark; the source must be positioned at
    /// the same place.
    pub fn new(
        source: Arc<BlockSource>,
        store: Arc<dyn IndexStore>,
        config: &IndexerConfig,
        cursor: Cursor,
    ) -> Self {
        Self {
            source,
            store,
            batch_size: config.batch_size.max(1),
            confirmation_depth: config.confirmation_depth,
            cursor: Mutex::new(cursor),
            state: Mutex::new(IndexerState::Idle),
            stop: Mutex::new(CancellationToken::new()),
            events: EventBus::default(),
        }
    }

    pub fn source(&self) -> &Arc<BlockSource> {
        &self.source
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    pub fn state(&self) -> IndexerState {
        *lock(&self.state)
    }

    /// Highest block fully merged, `None` if nothing has been merged yet.
    pub fn watermark(&self) -> Option<u64> {
        lock(&self.cursor).watermark
    }

    /// Subscribe to progress and error events.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Run the loop until [`IndexEngine::stop`] or an error.
    ///
    /// Returns immediately if the engine is already running. A stopped or
    /// crashed engine may be started again; it resumes at its watermark.
    pub async fn start(&self) -> Result<(), IndexerError> {
        let stop = {
            let mut state = lock(&self.state);
            if *state == IndexerState::Running {
                debug!("start ignored, already running");
                return Ok(());
            }
            *state = IndexerState::Running;
            let token = CancellationToken::new();
            *lock(&self.stop) = token.clone();
            token
        };
        info!(watermark = ?self.watermark(), batch_size = self.batch_size, "index engine started");

        match self.run_loop(&stop).await {
            Ok(()) => {
                *lock(&self.state) = IndexerState::Stopped;
                let watermark = self.watermark();
                info!(watermark = ?watermark, "index engine stopped");
                self.events.emit(IndexEvent::Stopped { watermark });
                Ok(())
            }
            Err(e) => {
                *lock(&self.state) = IndexerState::Crashed;
                let watermark = self.watermark();
                if e.is_fatal() {
                    error!(error = %e, watermark = ?watermark, "index engine crashed, stored index is inconsistent");
                } else {
                    warn!(error = %e, watermark = ?watermark, "index engine halted, restart resumes at the watermark");
                }
                self.events.emit(IndexEvent::Error { cause: e.clone() });
                Err(e)
            }
        }
    }

    /// Ask a running loop to exit. A wait for new blocks is interrupted; a
    /// merge in progress completes first.
    pub fn stop(&self) {
        if self.state() == IndexerState::Running {
            info!("stop requested");
        }
        lock(&self.stop).cancel();
    }

    async fn run_loop(&self, stop: &CancellationToken) -> Result<(), IndexerError> {
        let mut throughput = Throughput::new();
        loop {
            let batch = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                batch = self.source.next_batch(self.batch_size, self.confirmation_depth) => batch?,
            };
            let last = self.apply_batch(&batch).await?;
            throughput.record(batch.len() as u64, last);
        }
    }

    /// Merge one batch and advance the watermark to its last block.
    async fn apply_batch(&self, batch: &[Arc<Block>]) -> Result<u64, IndexerError> {
        let (first, last) = match (batch.first(), batch.last()) {
            (Some(first), Some(last)) => (first.number, last.number),
            _ => return Err(IndexerError::Inconsistency("block source returned an empty batch".into())),
        };
        self.validate(batch, first)?;

        let entries = extract_transfers(batch);
        let edges = entry_count(&entries);
        if edges > 0 {
            let written = self.store.merge_address_entries(&entries).await?;
            debug!(from = first, to = last, addresses = entries.len(), written, "merged batch");
        } else {
            debug!(from = first, to = last, "no transfers in batch, skipping merge");
        }

        self.store.set_watermark(last).await?;
        lock(&self.cursor).advance(last)?;
        self.source.advance(last)?;

        for block in batch {
            self.events.emit(IndexEvent::BlockIndexed { height: block.number });
        }
        debug!(from = first, to = last, edges, "batch indexed");
        Ok(last)
    }

    fn validate(&self, batch: &[Arc<Block>], first: u64) -> Result<(), IndexerError> {
        lock(&self.cursor).expect_next(first)?;
        for pair in batch.windows(2) {
            let (prev, next) = (pair[0].number, pair[1].number);
            if next != prev + 1 {
                return Err(IndexerError::Inconsistency(format!(
                    "batch jumps from block {prev} to {next}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fast_config, CountingStore, MockNode};
    use addrindex_core::types::{Address, Transaction, TxHash};
    use addrindex_storage::InMemoryStorage;

    struct Harness {
        node: Arc<MockNode>,
        store: Arc<CountingStore>,
        engine: Arc<IndexEngine>,
    }

    fn harness(node_tip: u64, source_at: Option<u64>, engine_at: Option<u64>) -> Harness {
        let node = Arc::new(MockNode::new(node_tip));
        let store = Arc::new(CountingStore::new(Arc::new(InMemoryStorage::default())));
        let config = IndexerConfig {
            batch_size: 5,
            ..fast_config()
        };
        let source = Arc::new(BlockSource::new(node.clone(), &config, Cursor::new(source_at)));
        let engine = Arc::new(IndexEngine::new(source, store.clone(), &config, Cursor::new(engine_at)));
        Harness { node, store, engine }
    }

    fn transfer_block(number: u64, from: u8, to: u8) -> Block {
        Block {
            number,
            hash: None,
            transactions: vec![Transaction {
                hash: TxHash::from_slice(&[number as u8; 32]).unwrap(),
                from: Some(Address([from; 20])),
                to: Some(Address([to; 20])),
                block_number: number,
            }],
        }
    }

    async fn wait_for_watermark(engine: &IndexEngine, target: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.watermark().map_or(true, |w| w < target) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watermark did not reach target");
    }

    #[tokio::test]
    async fn empty_blocks_advance_without_merge() {
        let h = harness(9, None, None);
        h.engine.source().refresh_tip().await.unwrap();
        let mut events = h.engine.subscribe();

        let running = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.start().await })
        };
        wait_for_watermark(&h.engine, 9).await;
        h.engine.stop();
        running.await.unwrap().unwrap();

        assert_eq!(h.store.merges(), 0);
        assert_eq!(h.store.get_watermark().await.unwrap(), Some(9));
        assert_eq!(h.engine.state(), IndexerState::Stopped);

        let mut heights = vec![];
        while let Ok(event) = events.try_recv() {
            match event {
                IndexEvent::BlockIndexed { height } => heights.push(height),
                IndexEvent::Stopped { watermark } => assert_eq!(watermark, Some(9)),
                IndexEvent::Error { cause } => panic!("unexpected error {cause}"),
            }
        }
        assert_eq!(heights, (0..=9).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn transfers_are_merged_and_watermark_is_monotonic() {
        let h = harness(12, Some(2), Some(2));
        h.node.insert_block(transfer_block(4, 0xa, 0xb));
        h.node.insert_block(transfer_block(11, 0xb, 0xa));
        h.engine.source().refresh_tip().await.unwrap();

        let mut events = h.engine.subscribe();
        let running = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.start().await })
        };
        wait_for_watermark(&h.engine, 12).await;
        h.engine.stop();
        running.await.unwrap().unwrap();

        let mut last = 2;
        while let Ok(IndexEvent::BlockIndexed { height }) = events.try_recv() {
            assert_eq!(height, last + 1);
            last = height;
        }
        assert_eq!(last, 12);

        let a = h.store.lookup_address(&Address([0xa; 20]), 0, None).await.unwrap();
        assert_eq!(a.len(), 2);
        assert!(!a[0].inbound && a[0].block_number == 4);
        assert!(a[1].inbound && a[1].block_number == 11);
    }

    #[tokio::test]
    async fn batch_not_following_watermark_crashes() {
        // Store says 89, source thinks 99: the first batch starts at 100.
        let h = harness(200, Some(99), Some(89));
        h.engine.source().refresh_tip().await.unwrap();
        let mut events = h.engine.subscribe();

        let err = h.engine.start().await.unwrap_err();
        assert!(matches!(err, IndexerError::Inconsistency(_)));
        assert_eq!(h.engine.state(), IndexerState::Crashed);
        assert_eq!(h.engine.watermark(), Some(89));
        assert_eq!(h.store.merges(), 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            IndexEvent::Error { cause: IndexerError::Inconsistency(_) }
        ));
    }

    #[tokio::test]
    async fn store_failure_leaves_watermark_untouched() {
        let h = harness(10, None, None);
        h.node.insert_block(transfer_block(0, 1, 2));
        h.store.fail_merges();
        h.engine.source().refresh_tip().await.unwrap();

        let err = h.engine.start().await.unwrap_err();
        assert!(matches!(err, IndexerError::Storage(_)));
        assert_eq!(h.engine.watermark(), None);
        assert_eq!(h.store.get_watermark().await.unwrap(), None);
        assert_eq!(h.engine.source().watermark(), None);
    }

    #[tokio::test]
    async fn stop_interrupts_wait_and_start_is_idempotent() {
        let h = harness(0, Some(0), Some(0));
        let running = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.start().await })
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.engine.state() != IndexerState::Running {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        // Second start is a no-op while the first is running.
        h.engine.start().await.unwrap();
        assert_eq!(h.engine.state(), IndexerState::Running);

        h.engine.stop();
        running.await.unwrap().unwrap();
        assert_eq!(h.engine.state(), IndexerState::Stopped);
        assert_eq!(h.engine.watermark(), Some(0));
    }
}
