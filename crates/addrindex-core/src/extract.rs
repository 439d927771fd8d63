//! Transfer-edge extraction: ordered blocks → per-address entries.

use std::borrow::Borrow;

use crate::types::{AddressEntries, AddressEntry, Block, Direction};

/// Group every value-transfer edge in `blocks` by address.
///
/// Each edge yields an outbound entry for the sender and an inbound entry for
/// the receiver; a self-transfer yields both on the same address. Entries keep
/// block order, then transaction order. Contract creations and transactions
/// without a sender are skipped.
pub fn extract_transfers<B: Borrow<Block>>(blocks: &[B]) -> AddressEntries {
    let mut entries = AddressEntries::new();
    for block in blocks {
        let block: &Block = block.borrow();
        for tx in &block.transactions {
            let Some((from, to)) = tx.transfer() else {
                continue;
            };
            entries
                .entry(from)
                .or_default()
                .push(AddressEntry::new(tx.hash.clone(), block.number, Direction::Outbound));
            entries
                .entry(to)
                .or_default()
                .push(AddressEntry::new(tx.hash.clone(), block.number, Direction::Inbound));
        }
    }
    entries
}
