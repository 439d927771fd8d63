//! Error types for the address indexing pipeline.

use thiserror::Error;

/// Errors that can occur while fetching, indexing, or querying.
///
/// `Connectivity` is the only transient class: the block source absorbs it
/// with retries and it never reaches the engine. Everything else halts the
/// engine.
#[derive(Debug, Clone, Error)]
pub enum IndexerError {
    /// The requested entity does not exist (yet).
    #[error("NotFound: {0}")]
    NotFound(String),

    /// Malformed request parameters or an oversized request.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The retry budget was exhausted.
    #[error("timed out after {attempts} attempts ({elapsed_ms}ms): {last_error}")]
    Timeout {
        attempts: u32,
        elapsed_ms: u64,
        last_error: String,
    },

    /// The node is unreachable or returned an unreadable response.
    #[error("Connection not open: {0}")]
    Connectivity(String),

    /// Watermark / batch mismatch.
    #[error("Inconsistency: {0}")]
    Inconsistency(String),

    /// The node answered with a (non-transient) error.
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored key or row could not be decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Misconfiguration detected at startup (e.g. wrong network).
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` for the transient connectivity class.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    /// Returns `true` if the entity was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` for logic bugs or external tampering.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Inconsistency(_) | Self::Codec(_))
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<hex::FromHexError> for IndexerError {
    fn from(e: hex::FromHexError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}
