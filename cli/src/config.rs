//! The `conf.json` file.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use addrindex_core::indexer::IndexerConfig;
use addrindex_evm::api::DEFAULT_MAX_LIMIT;
use addrindex_evm::{HttpClientConfig, Network};
use addrindex_storage::StorageConfig;

use crate::logging::LogConfig;

/// Everything the binary needs, loaded once and passed down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// JSON-RPC endpoint of the node.
    pub node_url: String,
    pub request_timeout_ms: u64,
    /// Largest page the read API serves.
    pub max_limit: usize,
    pub indexer: IndexerConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_url: "http://localhost:8545".into(),
            request_timeout_ms: 30_000,
            max_limit: DEFAULT_MAX_LIMIT,
            indexer: IndexerConfig::default(),
            storage: StorageConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Parse a config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Reject settings the indexer cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_url.trim().is_empty() {
            bail!("node_url is empty");
        }
        if self.max_limit == 0 {
            bail!("max_limit must be at least 1");
        }
        if self.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be positive");
        }
        self.network()?;
        self.indexer.validate()?;
        self.storage.validate()?;
        Ok(())
    }

    pub fn network(&self) -> anyhow::Result<Network> {
        Ok(self.indexer.network.parse()?)
    }

    pub fn http(&self) -> HttpClientConfig {
        HttpClientConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}
