//! Shared types for the indexing pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IndexerError;

/// Strip the conventional `0x` display prefix, if present.
pub fn unprefix_hex(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

// ─── Address ──────────────────────────────────────────────────────────────────

/// A 20-byte account address.
///
/// Displayed as lowercase hex *without* the `0x` prefix, the canonical form
/// for everything stored or indexed. Use [`Address::to_prefixed`] for UIs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const LEN: usize = 20;

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IndexerError> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| {
            IndexerError::InvalidInput(format!(
                "address must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `0x`-prefixed display form.
    pub fn to_prefixed(&self) -> String {
        format!("0x{self}")
    }
}

impl FromStr for Address {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = unprefix_hex(s.trim());
        if raw.len() != Self::LEN * 2 {
            return Err(IndexerError::InvalidInput(format!("not an address: {s:?}")));
        }
        let bytes = hex::decode(raw)?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─── TxHash ───────────────────────────────────────────────────────────────────

/// A transaction hash (1–32 raw bytes; 32 on every EVM chain).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxHash(Vec<u8>);

impl TxHash {
    pub const MAX_LEN: usize = 32;

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IndexerError> {
        if bytes.is_empty() || bytes.len() > Self::MAX_LEN {
            return Err(IndexerError::InvalidInput(format!(
                "tx hash must be 1..={} bytes, got {}",
                Self::MAX_LEN,
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_prefixed(&self) -> String {
        format!("0x{self}")
    }
}

impl FromStr for TxHash {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(unprefix_hex(s.trim()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─── Block / Transaction ──────────────────────────────────────────────────────

/// A transaction, reduced to what the address index needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: TxHash,
    pub from: Option<Address>,
    /// `None` for contract creations.
    pub to: Option<Address>,
    pub block_number: u64,
}

impl Transaction {
    /// Returns `(from, to)` if this transaction is a value-transfer edge.
    pub fn transfer(&self) -> Option<(Address, Address)> {
        Some((self.from?, self.to?))
    }
}

/// A fetched block. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    /// Block hash (`0x…`), kept for logging only.
    pub hash: Option<String>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// A block with no transactions.
    pub fn empty(number: u64) -> Self {
        Self {
            number,
            hash: None,
            transactions: vec![],
        }
    }
}

// ─── Address entries ──────────────────────────────────────────────────────────

/// Whether an address received or sent a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// Key marker byte. Inbound sorts before outbound within one height.
    pub const fn marker(self) -> u8 {
        match self {
            Self::Inbound => 0x00,
            Self::Outbound => 0x01,
        }
    }

    pub fn from_marker(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Inbound),
            0x01 => Some(Self::Outbound),
            _ => None,
        }
    }

    pub const fn is_inbound(self) -> bool {
        matches!(self, Self::Inbound)
    }
}

/// One transaction incident to an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressEntry {
    pub hash: TxHash,
    pub block_number: u64,
    pub inbound: bool,
}

impl AddressEntry {
    pub fn new(hash: TxHash, block_number: u64, direction: Direction) -> Self {
        Self {
            hash,
            block_number,
            inbound: direction.is_inbound(),
        }
    }

    pub fn direction(&self) -> Direction {
        if self.inbound {
            Direction::Inbound
        } else {
            Direction::Outbound
        }
    }
}

/// New entries for one address, produced by a single batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressUpdate {
    pub txs_in: Vec<AddressEntry>,
    pub txs_out: Vec<AddressEntry>,
}

impl AddressUpdate {
    pub fn push(&mut self, entry: AddressEntry) {
        if entry.inbound {
            self.txs_in.push(entry);
        } else {
            self.txs_out.push(entry);
        }
    }

    /// All entries, inbound first.
    pub fn entries(&self) -> impl Iterator<Item = &AddressEntry> {
        self.txs_in.iter().chain(self.txs_out.iter())
    }

    pub fn len(&self) -> usize {
        self.txs_in.len() + self.txs_out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-address updates for one batch.
pub type AddressEntries = BTreeMap<Address, AddressUpdate>;

/// Total number of entries across all addresses.
pub fn entry_count(entries: &AddressEntries) -> usize {
    entries.values().map(AddressUpdate::len).sum()
}

/// Read-API result for an address lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressHistory {
    pub txs: Vec<AddressEntry>,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
