//! addrindex-evm — node client, block source, index engine and read API.
//!
//! ```text
//! HttpNodeClient ──► BlockSource ──► IndexEngine ──► IndexStore
//!   (JSON-RPC)        tip tracker      validate         ▲
//!                     prefetch cache   extract          │
//!                     retry            merge/advance    IndexApi
//! ```

pub mod api;
pub mod builder;
pub mod client;
pub mod engine;
pub mod http;
pub mod network;
pub mod source;

#[cfg(test)]
mod mock;

pub use api::{AddressQuery, ApiError, IndexApi};
pub use builder::IndexerBuilder;
pub use client::{HeaderStream, NewHeader, NodeClient};
pub use engine::IndexEngine;
pub use http::{HttpClientConfig, HttpNodeClient};
pub use network::Network;
pub use source::{fetch_block_with_retry, BlockSource};
