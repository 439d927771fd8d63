//! Known networks and their identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use addrindex_core::error::IndexerError;

/// The network an indexer is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Ropsten,
    Rinkeby,
    Goerli,
    Kovan,
    Sepolia,
    /// Any network that is not one of the public ones (dev chains).
    Private,
}

impl Network {
    /// Every network with a fixed identifier.
    pub const PUBLIC: [Network; 6] = [
        Self::Mainnet,
        Self::Ropsten,
        Self::Rinkeby,
        Self::Goerli,
        Self::Kovan,
        Self::Sepolia,
    ];

    /// The network identifier, or `None` for `Private`.
    pub const fn network_id(self) -> Option<u64> {
        match self {
            Self::Mainnet => Some(1),
            Self::Ropsten => Some(3),
            Self::Rinkeby => Some(4),
            Self::Goerli => Some(5),
            Self::Kovan => Some(42),
            Self::Sepolia => Some(11_155_111),
            Self::Private => None,
        }
    }

    /// The public network with identifier `id`, if any.
    pub fn from_id(id: u64) -> Option<Self> {
        Self::PUBLIC.into_iter().find(|n| n.network_id() == Some(id))
    }

    /// Whether a node reporting `id` is on this network.
    pub fn accepts(self, id: u64) -> bool {
        match self.network_id() {
            Some(expected) => expected == id,
            None => Self::from_id(id).is_none(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Ropsten => "ropsten",
            Self::Rinkeby => "rinkeby",
            Self::Goerli => "goerli",
            Self::Kovan => "kovan",
            Self::Sepolia => "sepolia",
            Self::Private => "private",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" | "homestead" => Ok(Self::Mainnet),
            "ropsten" => Ok(Self::Ropsten),
            "rinkeby" => Ok(Self::Rinkeby),
            "goerli" => Ok(Self::Goerli),
            "kovan" => Ok(Self::Kovan),
            "sepolia" => Ok(Self::Sepolia),
            "private" | "dev" => Ok(Self::Private),
            other => Err(IndexerError::Config(format!("unknown network {other:?}"))),
        }
    }
}
