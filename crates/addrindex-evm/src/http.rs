//! HTTP JSON-RPC node client backed by `reqwest`.
//!
//! The client does not retry. Failures are classified so the caller can:
//! connection errors, timeouts, HTTP 5xx and undecodable bodies are
//! `Connectivity`; JSON-RPC error objects and HTTP 4xx are `Rpc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use addrindex_core::error::IndexerError;
use addrindex_core::types::{Address, Block, TxHash};

use crate::client::{block_from_json, parse_hex_u128, parse_hex_u64, parse_network_id, NodeClient};

// ─── Wire types ──────────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The result value (`null` if absent), or the error object.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Configuration for `HttpNodeClient`.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// JSON-RPC node client over HTTP.
pub struct HttpNodeClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpNodeClient {
    /// Create a client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IndexerError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, IndexerError> {
        Self::new(url, HttpClientConfig::default())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one request and return its result value.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, IndexerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| IndexerError::Connectivity(format!("{method}: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(IndexerError::Connectivity(format!("{method}: HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IndexerError::Rpc(format!(
                "{method}: HTTP {}: {body}",
                status.as_u16()
            )));
        }

        let decoded: JsonRpcResponse = resp.json().await.map_err(|e| {
            IndexerError::Connectivity(format!("{method}: invalid JSON-RPC response: {e}"))
        })?;

        decoded.into_result().map_err(|e| {
            tracing::debug!(method, code = e.code, message = %e.message, "node returned error");
            IndexerError::Rpc(format!("{method}: {e}"))
        })
    }
}

fn expect_str<'a>(method: &str, v: &'a Value) -> Result<&'a str, IndexerError> {
    v.as_str()
        .ok_or_else(|| IndexerError::Codec(format!("{method}: expected a string, got {v}")))
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn network_id(&self) -> Result<u64, IndexerError> {
        let v = self.call("net_version", vec![]).await?;
        parse_network_id(&v)
    }

    async fn current_height(&self) -> Result<u64, IndexerError> {
        let v = self.call("eth_blockNumber", vec![]).await?;
        parse_hex_u64(expect_str("eth_blockNumber", &v)?)
    }

    async fn get_block(&self, number: u64) -> Result<Block, IndexerError> {
        let v = self
            .call("eth_getBlockByNumber", vec![json!(format!("0x{number:x}")), json!(true)])
            .await?;
        if v.is_null() {
            return Err(IndexerError::NotFound(format!("block {number}")));
        }
        block_from_json(&v)
    }

    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<Value>, IndexerError> {
        let v = self
            .call("eth_getTransactionByHash", vec![json!(hash.to_prefixed())])
            .await?;
        Ok((!v.is_null()).then_some(v))
    }

    async fn get_balance(&self, address: &Address) -> Result<u128, IndexerError> {
        let v = self
            .call("eth_getBalance", vec![json!(address.to_prefixed()), json!("latest")])
            .await?;
        parse_hex_u128(expect_str("eth_getBalance", &v)?)
    }

    async fn send_raw_transaction(&self, raw: &str) -> Result<TxHash, IndexerError> {
        let v = self.call("eth_sendRawTransaction", vec![json!(raw)]).await?;
        expect_str("eth_sendRawTransaction", &v)?
            .parse()
            .map_err(|e: IndexerError| IndexerError::Codec(e.to_string()))
    }
}
