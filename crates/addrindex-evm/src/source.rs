//! `BlockSource`: ordered, prefetched block delivery.
//!
//! The source tracks the chain tip, keeps a bounded window of block fetches
//! in flight ahead of the watermark, and hands the engine contiguous batches
//! of confirmed blocks.
//!
//! ```text
//!            watermark                       tip - depth        tip
//!  ─────────────┤ next ─────── prefetch window ──┤─────────────────┤
//!               └─ next_batch returns min(available, max) blocks ─┘
//! ```
//!
//! Block fetches run as spawned tasks, at most `fetch_concurrency` at a time,
//! each retrying "not found yet" and connectivity failures with backoff. The
//! cache holds a shared handle per height so the prefetcher and
//! `next_batch` await the same fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use addrindex_core::cursor::Cursor;
use addrindex_core::error::IndexerError;
use addrindex_core::indexer::IndexerConfig;
use addrindex_core::retry::RetryPolicy;
use addrindex_core::types::Block;

use crate::client::{HeaderStream, NewHeader, NodeClient};
use crate::network::Network;

/// A fetch shared between the prefetcher and every reader of that height.
type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Block>, IndexerError>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fetch block `number`, retrying while the node is unreachable or has not
/// produced the block yet. Any other error is returned immediately.
pub async fn fetch_block_with_retry(
    client: &dyn NodeClient,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
    number: u64,
) -> Result<Block, IndexerError> {
    let block = retry
        .run(
            &format!("block {number}"),
            cancel,
            |e| e.is_transient() || e.is_not_found(),
            move || client.get_block(number),
        )
        .await?;
    if block.number != number {
        return Err(IndexerError::Inconsistency(format!(
            "asked the node for block {number}, got block {}",
            block.number
        )));
    }
    Ok(block)
}

/// Ordered block delivery with prefetching and tip tracking.
pub struct BlockSource {
    client: Arc<dyn NodeClient>,
    retry: RetryPolicy,
    prefetch_window: u64,
    confirmation_depth: u64,
    poll_interval: Duration,
    /// Highest height the node is known to have. Only ever raised.
    tip: watch::Sender<Option<u64>>,
    cursor: Mutex<Cursor>,
    cache: Mutex<HashMap<u64, SharedFetch>>,
    permits: Arc<Semaphore>,
    last_header: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl BlockSource {
    /// Create a source positioned at `cursor`. Nothing is fetched until the
    /// tip is known.
    pub fn new(client: Arc<dyn NodeClient>, config: &IndexerConfig, cursor: Cursor) -> Self {
        let (tip, _) = watch::channel(None);
        Self {
            client,
            retry: RetryPolicy::new(config.retry.clone()),
            prefetch_window: config.prefetch_window,
            confirmation_depth: config.confirmation_depth,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            tip,
            cursor: Mutex::new(cursor),
            cache: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(config.fetch_concurrency.max(1))),
            last_header: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn client(&self) -> &Arc<dyn NodeClient> {
        &self.client
    }

    /// Highest known chain height, `None` before the first reading.
    pub fn tip(&self) -> Option<u64> {
        *self.tip.borrow()
    }

    /// Highest block handed out and confirmed merged.
    pub fn watermark(&self) -> Option<u64> {
        lock(&self.cursor).watermark
    }

    pub fn next_block(&self) -> u64 {
        lock(&self.cursor).next_block()
    }

    /// Heights currently held in the prefetch cache, ascending.
    pub fn cached_heights(&self) -> Vec<u64> {
        let mut heights: Vec<u64> = lock(&self.cache).keys().copied().collect();
        heights.sort_unstable();
        heights
    }

    // ─── Network ─────────────────────────────────────────────────────────────

    /// Fail with a configuration error unless the node is on `expected`.
    /// Connectivity failures are retried.
    pub async fn ensure_correct_network(&self, expected: Network) -> Result<u64, IndexerError> {
        let client = self.client.as_ref();
        let id = self
            .retry
            .run("network id", &self.cancel, IndexerError::is_transient, move || {
                client.network_id()
            })
            .await?;

        if !expected.accepts(id) {
            let actual = match Network::from_id(id) {
                Some(network) => network.to_string(),
                None => format!("network {id}"),
            };
            return Err(IndexerError::Config(format!(
                "node is on {actual}, expected {expected}"
            )));
        }
        info!(network = %expected, network_id = id, "node network verified");
        Ok(id)
    }

    // ─── Tip ─────────────────────────────────────────────────────────────────

    /// Raise the tip to `height`. Lower or equal readings are ignored.
    /// Returns `true` if the tip moved.
    pub fn raise_tip(&self, height: u64) -> bool {
        let raised = self.tip.send_if_modified(|tip| match *tip {
            Some(current) if current >= height => false,
            _ => {
                *tip = Some(height);
                true
            }
        });
        if raised {
            debug!(tip = height, "tip raised");
            self.prefetch(self.prefetch_window);
        }
        raised
    }

    /// Ask the node for its height and raise the tip. Returns the tip.
    pub async fn refresh_tip(&self) -> Result<u64, IndexerError> {
        let height = self.client.current_height().await?;
        self.raise_tip(height);
        Ok(self.tip().unwrap_or(height))
    }

    /// Start the background tip tracker: a poller every `poll_interval`
    /// plus the node's header subscription when it has one. Runs until
    /// [`BlockSource::shutdown`].
    pub fn spawn_tip_tracker(self: &Arc<Self>) -> JoinHandle<()> {
        let source = Arc::clone(self);
        tokio::spawn(async move { source.track_tip().await })
    }

    async fn track_tip(&self) {
        let mut headers = match self.client.subscribe_new_headers().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "header subscription failed, polling only");
                None
            }
        };
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            subscribed = headers.is_some(),
            "tip tracker started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => Wake::Poll,
                header = next_header(&mut headers) => Wake::Header(header),
            };
            match wake {
                Wake::Poll => self.poll_tip().await,
                Wake::Header(Some(Ok(header))) => {
                    *lock(&self.last_header) = Some(Instant::now());
                    self.raise_tip(header.number);
                }
                Wake::Header(Some(Err(e))) => warn!(error = %e, "header subscription error"),
                Wake::Header(None) => {
                    info!("header subscription closed, polling only");
                    headers = None;
                }
            }
        }
        debug!("tip tracker stopped");
    }

    async fn poll_tip(&self) {
        let last_header = *lock(&self.last_header);
        if last_header.is_some_and(|seen| seen.elapsed() < self.poll_interval) {
            return;
        }
        match self.refresh_tip().await {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                warn!(error = %e, "node unreachable, is it running? tip not refreshed")
            }
            Err(e) => warn!(error = %e, "tip refresh failed"),
        }
    }

    // ─── Prefetch cache ──────────────────────────────────────────────────────

    /// Return the cached fetch for `number`, starting one if absent.
    fn cached_or_fetch(&self, number: u64) -> SharedFetch {
        lock(&self.cache)
            .entry(number)
            .or_insert_with(|| self.spawn_fetch(number))
            .clone()
    }

    fn spawn_fetch(&self, number: u64) -> SharedFetch {
        let client = Arc::clone(&self.client);
        let retry = self.retry.clone();
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| IndexerError::Aborted {
                reason: format!("block {number}: fetch pool closed"),
            })?;
            fetch_block_with_retry(client.as_ref(), &retry, &cancel, number)
                .await
                .map(Arc::new)
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(IndexerError::Other(format!("fetch of block {number} panicked: {e}"))),
            }
        }
        .boxed()
        .shared()
    }

    /// Start fetches for every uncached height in
    /// `[watermark + 1, watermark + window]`, capped at the confirmed tip.
    ///
    /// The pass runs under the cache lock, so concurrent triggers collapse
    /// into one.
    pub fn prefetch(&self, window: u64) {
        let Some(tip) = self.tip() else {
            return;
        };
        let Some(confirmed) = tip.checked_sub(self.confirmation_depth) else {
            return;
        };
        let next = self.next_block();
        if window == 0 || next > confirmed {
            return;
        }
        let last = next.saturating_add(window - 1).min(confirmed);

        let mut cache = lock(&self.cache);
        let mut issued = 0u64;
        for number in next..=last {
            if !cache.contains_key(&number) {
                cache.insert(number, self.spawn_fetch(number));
                issued += 1;
            }
        }
        if issued > 0 {
            debug!(from = next, to = last, issued, "prefetching blocks");
        }
    }

    fn evict(&self, number: u64) {
        lock(&self.cache).remove(&number);
    }

    // ─── Delivery ────────────────────────────────────────────────────────────

    /// Wait until at least one block is confirmed past the watermark, then
    /// return the next `min(available, max_batch_size)` blocks in order.
    ///
    /// `available = tip - watermark - confirmation_depth`. A block that
    /// fails with a non-retryable error is evicted and the error returned.
    pub async fn next_batch(
        &self,
        max_batch_size: u64,
        confirmation_depth: u64,
    ) -> Result<Vec<Arc<Block>>, IndexerError> {
        let mut tip_rx = self.tip.subscribe();
        let count = loop {
            let tip = *tip_rx.borrow_and_update();
            let available = match tip {
                Some(tip) => lock(&self.cursor).available(tip, confirmation_depth),
                None => 0,
            };
            if available >= 1 {
                break available.min(max_batch_size.max(1));
            }
            tokio::select! {
                changed = tip_rx.changed() => {
                    if changed.is_err() {
                        return Err(IndexerError::Aborted { reason: "tip channel closed".into() });
                    }
                }
                _ = self.cancel.cancelled() => {
                    return Err(IndexerError::Aborted { reason: "block source shut down".into() });
                }
            }
        };

        let first = self.next_block();
        let fetches: Vec<SharedFetch> = (first..first + count)
            .map(|number| self.cached_or_fetch(number))
            .collect();
        let results = futures::future::join_all(fetches).await;

        let mut blocks = Vec::with_capacity(results.len());
        for (number, result) in (first..).zip(results) {
            match result {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    self.evict(number);
                    return Err(e);
                }
            }
        }
        debug!(from = first, count, "batch ready");
        Ok(blocks)
    }

    /// Move the watermark to `to`, drop cached blocks at or below it, and
    /// top up the prefetch window.
    pub fn advance(&self, to: u64) -> Result<(), IndexerError> {
        lock(&self.cursor).advance(to)?;
        lock(&self.cache).retain(|number, _| *number > to);
        self.prefetch(self.prefetch_window);
        Ok(())
    }

    /// Stop the tip tracker and abort pending retries and waits.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

enum Wake {
    Poll,
    Header(Option<Result<NewHeader, IndexerError>>),
}

async fn next_header(headers: &mut Option<HeaderStream>) -> Option<Result<NewHeader, IndexerError>> {
    match headers {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
