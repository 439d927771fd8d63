//! addrindex-core — foundation for the address transaction indexer.
//!
//! # Architecture
//!
//! ```text
//! NodeClient → BlockSource → IndexEngine → IndexStore → IndexApi
//!                                ├── extract_transfers (blocks → per-address entries)
//!                                ├── Cursor            (watermark rules)
//!                                └── EventBus          (BlockIndexed / Error / Stopped)
//! ```
//!
//! This crate holds the chain-agnostic pieces: data types, the binary key
//! codec, the `IndexStore` contract, and the retry policy. The node-facing
//! pipeline lives in `addrindex-evm`, storage adapters in `addrindex-storage`.

pub mod codec;
pub mod cursor;
pub mod error;
pub mod event;
pub mod extract;
pub mod indexer;
pub mod retry;
pub mod store;
pub mod types;

pub use codec::{EntryKey, KeyCodec, KeyFraming};
pub use cursor::Cursor;
pub use error::IndexerError;
pub use event::{EventBus, IndexEvent};
pub use extract::extract_transfers;
pub use indexer::{IndexerConfig, IndexerState};
pub use retry::{RetryConfig, RetryPolicy};
pub use store::{load_or_init_watermark, DuplicatePolicy, IndexStore, WatermarkRecord, WATERMARK_KEY};
pub use types::{
    entry_count, Address, AddressEntries, AddressEntry, AddressHistory, AddressUpdate, Block,
    Direction, Transaction, TxHash,
};
