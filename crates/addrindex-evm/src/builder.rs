//! Fluent builder API for creating address indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use addrindex_evm::{HttpNodeClient, IndexerBuilder};
//! use addrindex_storage::InMemoryStorage;
//!
//! # async fn run() -> Result<(), addrindex_core::IndexerError> {
//! let client = Arc::new(HttpNodeClient::default_for("http://localhost:8545")?);
//! let engine = IndexerBuilder::new()
//!     .network("goerli")
//!     .start_block(200_000)
//!     .confirmation_depth(15)
//!     .batch_size(100)
//!     .build(client, Arc::new(InMemoryStorage::default()))
//!     .await?;
//! engine.source().spawn_tip_tracker();
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::info;

use addrindex_core::cursor::Cursor;
use addrindex_core::error::IndexerError;
use addrindex_core::indexer::IndexerConfig;
use addrindex_core::retry::RetryConfig;
use addrindex_core::store::{load_or_init_watermark, IndexStore};

use crate::client::NodeClient;
use crate::engine::IndexEngine;
use crate::network::Network;
use crate::source::BlockSource;

/// Fluent builder for `IndexerConfig` and the engine wired from it.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Start from an existing config.
    pub fn from_config(config: IndexerConfig) -> Self {
        Self { config }
    }

    /// Set the network the node must be on.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.config.network = network.into();
        self
    }

    /// Set the first block to index on a fresh store.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Set confirmation depth (blocks behind tip before processing).
    pub fn confirmation_depth(mut self, depth: u64) -> Self {
        self.config.confirmation_depth = depth;
        self
    }

    /// Set the maximum number of blocks merged per batch.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set how many blocks ahead of the watermark are fetched.
    pub fn prefetch_window(mut self, blocks: u64) -> Self {
        self.config.prefetch_window = blocks;
        self
    }

    /// Set the maximum number of concurrent block fetches.
    pub fn fetch_concurrency(mut self, n: usize) -> Self {
        self.config.fetch_concurrency = n;
        self
    }

    /// Set tip polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Validate the config, check the node's network, load (or initialize)
    /// the watermark and wire a [`BlockSource`] and [`IndexEngine`].
    ///
    /// Nothing is written to the store until the network check passes.
    ///
    /// The engine is idle; call `source().spawn_tip_tracker()` and
    /// `start()` to run it.
    pub async fn build(
        self,
        client: Arc<dyn NodeClient>,
        store: Arc<dyn IndexStore>,
    ) -> Result<IndexEngine, IndexerError> {
        let config = self.config;
        config.validate()?;
        let network: Network = config.network.parse()?;

        let cursor = match store.get_watermark().await? {
            Some(saved) => Cursor::new(Some(saved)),
            None => Cursor::before(config.start_block),
        };
        let source = Arc::new(BlockSource::new(client, &config, cursor));
        source.ensure_correct_network(network).await?;

        let persisted = load_or_init_watermark(store.as_ref(), config.start_block).await?;
        if persisted != cursor {
            return Err(IndexerError::Inconsistency(format!(
                "watermark changed during startup: {:?} -> {:?}",
                cursor.watermark, persisted.watermark
            )));
        }

        info!(
            network = %network,
            watermark = ?cursor.watermark,
            confirmation_depth = config.confirmation_depth,
            batch_size = config.batch_size,
            "indexer built"
        );
        Ok(IndexEngine::new(source, store, &config, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fast_config, MockNode};
    use addrindex_storage::InMemoryStorage;

    #[test]
    fn builder_defaults() {
        let cfg = IndexerBuilder::new().build_config();
        assert_eq!(cfg.network, "mainnet");
        assert_eq!(cfg.confirmation_depth, 15);
        assert_eq!(cfg.batch_size, 100);
    }

    #[test]
    fn builder_custom() {
        let cfg = IndexerBuilder::new()
            .network("goerli")
            .start_block(200_000)
            .confirmation_depth(32)
            .batch_size(500)
            .prefetch_window(64)
            .fetch_concurrency(4)
            .build_config();

        assert_eq!(cfg.network, "goerli");
        assert_eq!(cfg.start_block, 200_000);
        assert_eq!(cfg.confirmation_depth, 32);
        assert_eq!(cfg.batch_size, 500);
        assert_eq!(cfg.prefetch_window, 64);
        assert_eq!(cfg.fetch_concurrency, 4);
    }

    #[tokio::test]
    async fn build_initializes_watermark_below_start_block() {
        let store = Arc::new(InMemoryStorage::default());
        let engine = IndexerBuilder::from_config(fast_config())
            .start_block(200)
            .build(Arc::new(MockNode::new(300)), store.clone())
            .await
            .unwrap();
        assert_eq!(engine.watermark(), Some(199));
        assert_eq!(engine.source().next_block(), 200);
        assert_eq!(store.get_watermark().await.unwrap(), Some(199));
    }

    #[tokio::test]
    async fn build_rejects_bad_config_and_wrong_network() {
        let store: Arc<dyn IndexStore> = Arc::new(InMemoryStorage::default());

        let zero_batch = IndexerBuilder::from_config(fast_config())
            .batch_size(0)
            .build(Arc::new(MockNode::new(0)), store.clone())
            .await;
        assert!(matches!(zero_batch, Err(IndexerError::Config(_))));

        let wrong_network = IndexerBuilder::from_config(fast_config())
            .network("mainnet")
            .build(Arc::new(MockNode::new(0).with_network_id(5)), store.clone())
            .await;
        assert!(matches!(wrong_network, Err(IndexerError::Config(_))));

        let unknown = IndexerBuilder::from_config(fast_config())
            .network("atlantis")
            .build(Arc::new(MockNode::new(0)), store)
            .await;
        assert!(matches!(unknown, Err(IndexerError::Config(_))));
    }

    #[tokio::test]
    async fn failed_network_check_leaves_store_untouched() {
        let store = Arc::new(InMemoryStorage::default());
        let wrong_network = IndexerBuilder::from_config(fast_config())
            .network("mainnet")
            .start_block(500)
            .build(Arc::new(MockNode::new(600).with_network_id(5)), store.clone())
            .await;
        assert!(matches!(wrong_network, Err(IndexerError::Config(_))));
        assert_eq!(store.get_watermark().await.unwrap(), None);

        // A corrected, lower start block still takes effect.
        let engine = IndexerBuilder::from_config(fast_config())
            .start_block(300)
            .build(Arc::new(MockNode::new(600)), store.clone())
            .await
            .unwrap();
        assert_eq!(engine.watermark(), Some(299));
        assert_eq!(store.get_watermark().await.unwrap(), Some(299));
    }

    #[tokio::test]
    async fn build_resumes_from_stored_watermark() {
        let store = Arc::new(InMemoryStorage::default());
        store.set_watermark(41).await.unwrap();
        let engine = IndexerBuilder::from_config(fast_config())
            .start_block(300)
            .build(Arc::new(MockNode::new(600)), store.clone())
            .await
            .unwrap();
        assert_eq!(engine.watermark(), Some(41));
        assert_eq!(engine.source().next_block(), 42);
    }
}
