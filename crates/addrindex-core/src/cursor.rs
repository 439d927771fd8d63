//! Indexer cursor: the watermark and the rules for moving it.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// The indexer's position in the chain.
///
/// `watermark` is the highest contiguous block fully merged into the index;
/// `None` means nothing has been merged yet (start block 0).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub watermark: Option<u64>,
}

impl Cursor {
    pub fn new(watermark: Option<u64>) -> Self {
        Self { watermark }
    }

    /// Cursor positioned just below `start_block`.
    pub fn before(start_block: u64) -> Self {
        Self::new(start_block.checked_sub(1))
    }

    /// Returns the next block to process (watermark + 1).
    pub fn next_block(&self) -> u64 {
        self.watermark.map_or(0, |w| w + 1)
    }

    /// Number of blocks that are confirmed and not yet processed:
    /// `tip - watermark - confirmation_depth`, floored at zero.
    pub fn available(&self, tip: u64, confirmation_depth: u64) -> u64 {
        tip.checked_sub(confirmation_depth)
            .and_then(|confirmed| confirmed.checked_sub(self.next_block()))
            .map_or(0, |ahead| ahead.saturating_add(1))
    }

    /// Fails unless `first` is exactly the next block.
    pub fn expect_next(&self, first: u64) -> Result<(), IndexerError> {
        let expected = self.next_block();
        if first != expected {
            return Err(IndexerError::Inconsistency(format!(
                "batch starts at block {first}, expected {expected}"
            )));
        }
        Ok(())
    }

    /// Advance the watermark to `to`. The watermark never moves backwards.
    pub fn advance(&mut self, to: u64) -> Result<(), IndexerError> {
        if let Some(current) = self.watermark {
            if to < current {
                return Err(IndexerError::Inconsistency(format!(
                    "watermark would rewind from {current} to {to}"
                )));
            }
        }
        self.watermark = Some(to);
        Ok(())
    }
}
