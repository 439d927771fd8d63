//! Node client contract and JSON decoding helpers.
//!
//! A `NodeClient` wraps the remote node. Every call may fail with
//! `IndexerError::Connectivity` when the node is unreachable; retrying is the
//! caller's job (`BlockSource` does it for block fetches).

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use addrindex_core::error::IndexerError;
use addrindex_core::types::{Address, Block, Transaction, TxHash};

/// A new-head notification. Only the height matters to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewHeader {
    pub number: u64,
}

/// Stream of new-head notifications.
pub type HeaderStream = BoxStream<'static, Result<NewHeader, IndexerError>>;

/// Access to a remote node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// The node's network identifier (`net_version`).
    async fn network_id(&self) -> Result<u64, IndexerError>;

    /// Height of the newest block the node knows about.
    async fn current_height(&self) -> Result<u64, IndexerError>;

    /// Block `number` with full transactions, or `NotFound` if the node has
    /// not produced it yet.
    async fn get_block(&self, number: u64) -> Result<Block, IndexerError>;

    /// Push notifications for new heads, if the transport supports them.
    async fn subscribe_new_headers(&self) -> Result<Option<HeaderStream>, IndexerError> {
        Ok(None)
    }

    /// The node's transaction object, or `None` if unknown.
    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<Value>, IndexerError>;

    /// Balance in wei at the latest block.
    async fn get_balance(&self, address: &Address) -> Result<u128, IndexerError>;

    /// Submit a signed raw transaction (`0x`-prefixed hex). Returns its hash.
    async fn send_raw_transaction(&self, raw: &str) -> Result<TxHash, IndexerError>;
}

// ─── JSON helpers ────────────────────────────────────────────────────────────

/// Parse a hex quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, IndexerError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|e| IndexerError::Codec(format!("bad hex quantity {s:?}: {e}")))
}

/// Parse a hex quantity (with or without `0x`) to u128.
pub fn parse_hex_u128(s: &str) -> Result<u128, IndexerError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u128::from_str_radix(digits, 16)
        .map_err(|e| IndexerError::Codec(format!("bad hex quantity {s:?}: {e}")))
}

/// Parse a `net_version` result: a decimal string, a hex string, or a number.
pub fn parse_network_id(v: &Value) -> Result<u64, IndexerError> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| IndexerError::Codec(format!("bad network id {n}"))),
        Value::String(s) if s.starts_with("0x") => parse_hex_u64(s),
        Value::String(s) => s
            .parse()
            .map_err(|_| IndexerError::Codec(format!("bad network id {s:?}"))),
        other => Err(IndexerError::Codec(format!("bad network id {other}"))),
    }
}

fn optional_address(v: &Value) -> Result<Option<Address>, IndexerError> {
    match v.as_str() {
        None | Some("") | Some("0x") => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e: IndexerError| IndexerError::Codec(e.to_string())),
    }
}

/// Convert a full transaction object to a `Transaction`.
///
/// `block_number` is used when the object omits `blockNumber`.
pub fn transaction_from_json(v: &Value, block_number: u64) -> Result<Transaction, IndexerError> {
    let hash = v["hash"]
        .as_str()
        .ok_or_else(|| IndexerError::Codec("transaction without hash".into()))?
        .parse::<TxHash>()
        .map_err(|e| IndexerError::Codec(e.to_string()))?;
    let block_number = match v["blockNumber"].as_str() {
        Some(n) => parse_hex_u64(n)?,
        None => block_number,
    };
    Ok(Transaction {
        hash,
        from: optional_address(&v["from"])?,
        to: optional_address(&v["to"])?,
        block_number,
    })
}

/// Convert an `eth_getBlockByNumber(n, true)` result to a `Block`.
pub fn block_from_json(v: &Value) -> Result<Block, IndexerError> {
    let number = parse_hex_u64(
        v["number"]
            .as_str()
            .ok_or_else(|| IndexerError::Codec("block without number".into()))?,
    )?;
    let transactions = match v["transactions"].as_array() {
        Some(txs) => txs
            .iter()
            .map(|tx| {
                if tx.is_string() {
                    return Err(IndexerError::Codec(
                        "expected full transaction objects, got hashes".into(),
                    ));
                }
                transaction_from_json(tx, number)
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![],
    };
    Ok(Block {
        number,
        hash: v["hash"].as_str().map(str::to_string),
        transactions,
    })
}
