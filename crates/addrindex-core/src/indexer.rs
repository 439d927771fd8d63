//! Indexer configuration and state types.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::retry::RetryConfig;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Network the node must be on (e.g. `"mainnet"`, `"goerli"`, `"private"`).
    pub network: String,
    /// First block to index. The watermark starts at `start_block - 1`.
    pub start_block: u64,
    /// Number of blocks to wait before considering a block confirmed.
    /// 0 disables the margin (instant-finality dev chains).
    pub confirmation_depth: u64,
    /// Maximum number of blocks handed to the engine per batch.
    pub batch_size: u64,
    /// How many blocks ahead of the watermark to prefetch.
    pub prefetch_window: u64,
    /// Maximum concurrent block fetches.
    pub fetch_concurrency: usize,
    /// Tip polling interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Backoff for block fetches.
    pub retry: RetryConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".into(),
            start_block: 0,
            confirmation_depth: 15,
            batch_size: 100,
            prefetch_window: 200,
            fetch_concurrency: 20,
            poll_interval_ms: 6_000,
            retry: RetryConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batch_size must be at least 1".into()));
        }
        if self.fetch_concurrency == 0 {
            return Err(IndexerError::Config("fetch_concurrency must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(IndexerError::Config("poll_interval_ms must be positive".into()));
        }
        if self.start_block > u32::MAX as u64 {
            return Err(IndexerError::Config(format!(
                "start_block {} exceeds the 4-byte key height",
                self.start_block
            )));
        }
        Ok(())
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Draining batches from the block source.
    Running,
    /// Exited after `stop()`.
    Stopped,
    /// Halted on an unrecoverable error.
    Crashed,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}
