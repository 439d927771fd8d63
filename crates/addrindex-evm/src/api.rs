//! Read API: address history from the store, everything else proxied to the
//! node.
//!
//! Every method returns [`ApiError`], which carries an HTTP-style status and a
//! caller-safe message. Internal error detail is logged, never returned.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use addrindex_core::error::IndexerError;
use addrindex_core::store::IndexStore;
use addrindex_core::types::{unprefix_hex, Address, AddressHistory, TxHash};

use crate::client::NodeClient;

/// Largest `limit` a caller may ask for; also the limit when none is given.
pub const DEFAULT_MAX_LIMIT: usize = 1_000;

/// Error returned to API callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{status}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    pub const NOT_FOUND: u16 = 404;
    pub const BAD_REQUEST: u16 = 400;
    pub const GATEWAY_TIMEOUT: u16 = 504;
    pub const INTERNAL: u16 = 500;
}

impl From<IndexerError> for ApiError {
    fn from(e: IndexerError) -> Self {
        match e {
            IndexerError::NotFound(msg) => {
                debug!(%msg, "api: not found");
                Self {
                    status: Self::NOT_FOUND,
                    message: format!("not found: {msg}"),
                }
            }
            IndexerError::InvalidInput(msg) => {
                debug!(%msg, "api: invalid input");
                Self {
                    status: Self::BAD_REQUEST,
                    message: msg,
                }
            }
            e @ IndexerError::Timeout { .. } => {
                error!(error = %e, "api request timed out");
                Self {
                    status: Self::GATEWAY_TIMEOUT,
                    message: "timed out".into(),
                }
            }
            e => {
                error!(error = %e, "api request failed");
                Self {
                    status: Self::INTERNAL,
                    message: "internal error".into(),
                }
            }
        }
    }
}

/// Parameters of [`IndexApi::get_address`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressQuery {
    pub address: String,
    /// Only entries at or above this height.
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AddressQuery {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }
}

/// The query surface handed to an HTTP layer or the CLI.
#[derive(Clone)]
pub struct IndexApi {
    store: Arc<dyn IndexStore>,
    client: Arc<dyn NodeClient>,
    max_limit: usize,
}

impl IndexApi {
    pub fn new(store: Arc<dyn IndexStore>, client: Arc<dyn NodeClient>) -> Self {
        Self {
            store,
            client,
            max_limit: DEFAULT_MAX_LIMIT,
        }
    }

    pub fn with_max_limit(mut self, max_limit: usize) -> Self {
        self.max_limit = max_limit.max(1);
        self
    }

    pub fn max_limit(&self) -> usize {
        self.max_limit
    }

    /// Transactions incident to an address, ascending by block number.
    ///
    /// An address with no history is `NotFound` unless a `block_number`
    /// filter was given, in which case the result is simply empty.
    pub async fn get_address(&self, query: &AddressQuery) -> Result<AddressHistory, ApiError> {
        let address: Address = query.address.parse()?;
        let limit = match query.limit {
            Some(0) => return Err(IndexerError::InvalidInput("limit must be at least 1".into()).into()),
            Some(n) if n > self.max_limit => {
                return Err(IndexerError::InvalidInput(format!(
                    "limit {n} exceeds the maximum of {}",
                    self.max_limit
                ))
                .into())
            }
            Some(n) => n,
            None => self.max_limit,
        };

        let from_height = query.block_number.unwrap_or(0);
        let txs = self
            .store
            .lookup_address(&address, from_height, Some(limit))
            .await?;
        if txs.is_empty() && query.block_number.is_none() {
            return Err(IndexerError::NotFound(format!("address {}", address.to_prefixed())).into());
        }
        Ok(AddressHistory { txs })
    }

    /// Highest block merged into the index, `None` before the first batch.
    pub async fn get_processed_height(&self) -> Result<Option<u64>, ApiError> {
        Ok(self.store.get_watermark().await?)
    }

    /// The node's current height.
    pub async fn get_block_number(&self) -> Result<u64, ApiError> {
        Ok(self.client.current_height().await?)
    }

    pub async fn get_transaction(&self, hash: &str) -> Result<Value, ApiError> {
        let hash: TxHash = hash.parse()?;
        match self.client.get_transaction(&hash).await? {
            Some(tx) => Ok(tx),
            None => Err(IndexerError::NotFound(format!("transaction {}", hash.to_prefixed())).into()),
        }
    }

    /// Balance in wei, as a decimal string.
    pub async fn get_balance(&self, address: &str) -> Result<String, ApiError> {
        let address: Address = address.parse()?;
        let wei = self.client.get_balance(&address).await?;
        Ok(wei.to_string())
    }

    /// Broadcast a signed, hex-encoded transaction. Returns its hash.
    pub async fn send_signed_transaction(&self, raw: &str) -> Result<TxHash, ApiError> {
        let body = unprefix_hex(raw.trim());
        if body.is_empty() {
            return Err(IndexerError::InvalidInput("empty transaction".into()).into());
        }
        hex::decode(body).map_err(IndexerError::from)?;
        Ok(self.client.send_raw_transaction(&format!("0x{body}")).await?)
    }
}
