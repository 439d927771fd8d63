//! Binary key codec for the ordered key-value backend.
//!
//! An address entry is packed into a single sortable key:
//!
//! ```text
//! Fixed:          address(20) ‖ height(4, BE) ‖ direction(1) ‖ hash(n)
//! LengthPrefixed: 14 ‖ address ‖ 04 ‖ height ‖ 01 ‖ direction ‖ len ‖ hash
//! ```
//!
//! Heights are fixed-width big-endian, so lexicographic byte order equals
//! numeric order and "all entries of address X from height H onward" is one
//! range scan. The value stored under a key is empty; membership lives
//! entirely in the key.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::{Address, AddressEntry, Direction, TxHash};

const HEIGHT_LEN: usize = 4;
const DIRECTION_LEN: usize = 1;
const FIXED_HEADER_LEN: usize = Address::LEN + HEIGHT_LEN + DIRECTION_LEN;

/// Key layout variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyFraming {
    /// Fixed-width fields, hash takes the remainder.
    #[default]
    Fixed,
    /// Every field preceded by a 1-byte length marker.
    LengthPrefixed,
}

/// A decoded address-entry key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryKey {
    pub address: Address,
    pub block_number: u64,
    pub direction: Direction,
    pub hash: TxHash,
}

impl EntryKey {
    pub fn new(address: Address, entry: &AddressEntry) -> Self {
        Self {
            address,
            block_number: entry.block_number,
            direction: entry.direction(),
            hash: entry.hash.clone(),
        }
    }

    pub fn into_entry(self) -> AddressEntry {
        AddressEntry::new(self.hash, self.block_number, self.direction)
    }
}

/// Encodes and decodes address-entry keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyCodec {
    framing: KeyFraming,
}

impl KeyCodec {
    pub fn new(framing: KeyFraming) -> Self {
        Self { framing }
    }

    pub fn framing(&self) -> KeyFraming {
        self.framing
    }

    /// Encode a key. Fails if the height does not fit the 4-byte field.
    pub fn encode(&self, key: &EntryKey) -> Result<Vec<u8>, IndexerError> {
        let height = encode_height(key.block_number)?;
        let direction = [key.direction.marker()];
        match self.framing {
            KeyFraming::Fixed => {
                let mut out = Vec::with_capacity(FIXED_HEADER_LEN + key.hash.as_bytes().len());
                out.extend_from_slice(key.address.as_bytes());
                out.extend_from_slice(&height);
                out.extend_from_slice(&direction);
                out.extend_from_slice(key.hash.as_bytes());
                Ok(out)
            }
            KeyFraming::LengthPrefixed => frame(&[
                key.address.as_bytes(),
                &height,
                &direction,
                key.hash.as_bytes(),
            ]),
        }
    }

    /// Decode a key produced by [`KeyCodec::encode`] with the same framing.
    pub fn decode(&self, buf: &[u8]) -> Result<EntryKey, IndexerError> {
        let (address, height, direction, hash) = match self.framing {
            KeyFraming::Fixed => {
                if buf.len() <= FIXED_HEADER_LEN {
                    return Err(IndexerError::Codec(format!(
                        "key too short: {} bytes",
                        buf.len()
                    )));
                }
                let (address, rest) = buf.split_at(Address::LEN);
                let (height, rest) = rest.split_at(HEIGHT_LEN);
                let (direction, hash) = rest.split_at(DIRECTION_LEN);
                (address, height, direction, hash)
            }
            KeyFraming::LengthPrefixed => match unframe(buf)?.as_slice() {
                [address, height, direction, hash] => (*address, *height, *direction, *hash),
                parts => {
                    return Err(IndexerError::Codec(format!(
                        "expected 4 key parts, got {}",
                        parts.len()
                    )))
                }
            },
        };

        Ok(EntryKey {
            address: Address::from_slice(address).map_err(codec_err)?,
            block_number: decode_height(height)?,
            direction: decode_direction(direction)?,
            hash: TxHash::from_slice(hash).map_err(codec_err)?,
        })
    }

    /// Inclusive key bounds covering `address` at heights `from..=to`.
    ///
    /// `to` is clamped to the largest encodable height.
    pub fn range(
        &self,
        address: &Address,
        from: u64,
        to: u64,
    ) -> Result<(Vec<u8>, Vec<u8>), IndexerError> {
        let from = encode_height(from)?;
        let to = (to.min(u32::MAX as u64) as u32).to_be_bytes();
        Ok((
            self.height_prefix(address, &from, 0x00),
            self.height_prefix(address, &to, 0xff),
        ))
    }

    fn height_prefix(&self, address: &Address, height: &[u8; HEIGHT_LEN], tail: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_HEADER_LEN + 2);
        if self.framing == KeyFraming::LengthPrefixed {
            out.push(Address::LEN as u8);
        }
        out.extend_from_slice(address.as_bytes());
        if self.framing == KeyFraming::LengthPrefixed {
            out.push(HEIGHT_LEN as u8);
        }
        out.extend_from_slice(height);
        out.push(tail);
        out
    }

    /// Encode an address-less row (height, direction, hash) in length-prefixed
    /// framing. Used as a set member by the set-backed store.
    pub fn encode_row(entry: &AddressEntry) -> Result<Vec<u8>, IndexerError> {
        let height = encode_height(entry.block_number)?;
        frame(&[&height, &[entry.direction().marker()], entry.hash.as_bytes()])
    }

    pub fn decode_row(buf: &[u8]) -> Result<AddressEntry, IndexerError> {
        match unframe(buf)?.as_slice() {
            [height, direction, hash] => Ok(AddressEntry::new(
                TxHash::from_slice(hash).map_err(codec_err)?,
                decode_height(height)?,
                decode_direction(direction)?,
            )),
            parts => Err(IndexerError::Codec(format!(
                "expected 3 row parts, got {}",
                parts.len()
            ))),
        }
    }
}

fn codec_err(e: IndexerError) -> IndexerError {
    IndexerError::Codec(e.to_string())
}

fn encode_height(block_number: u64) -> Result<[u8; HEIGHT_LEN], IndexerError> {
    u32::try_from(block_number)
        .map(u32::to_be_bytes)
        .map_err(|_| {
            IndexerError::InvalidInput(format!("block number {block_number} exceeds 4-byte key field"))
        })
}

fn decode_height(buf: &[u8]) -> Result<u64, IndexerError> {
    let arr: [u8; HEIGHT_LEN] = buf
        .try_into()
        .map_err(|_| IndexerError::Codec(format!("height field is {} bytes", buf.len())))?;
    Ok(u32::from_be_bytes(arr) as u64)
}

fn decode_direction(buf: &[u8]) -> Result<Direction, IndexerError> {
    match buf {
        [byte] => Direction::from_marker(*byte)
            .ok_or_else(|| IndexerError::Codec(format!("unknown direction marker {byte:#04x}"))),
        _ => Err(IndexerError::Codec(format!("direction field is {} bytes", buf.len()))),
    }
}

/// Concatenate parts, each preceded by a 1-byte length marker.
fn frame(parts: &[&[u8]]) -> Result<Vec<u8>, IndexerError> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for part in parts {
        let len = u8::try_from(part.len())
            .map_err(|_| IndexerError::InvalidInput(format!("key part too long: {} bytes", part.len())))?;
        out.push(len);
        out.extend_from_slice(part);
    }
    Ok(out)
}

fn unframe(buf: &[u8]) -> Result<Vec<&[u8]>, IndexerError> {
    let mut parts = Vec::with_capacity(4);
    let mut idx = 0;
    while idx < buf.len() {
        let len = buf[idx] as usize;
        idx += 1;
        let end = idx + len;
        if end > buf.len() {
            return Err(IndexerError::Codec(format!(
                "truncated key part at offset {idx}: need {len} bytes, have {}",
                buf.len() - idx
            )));
        }
        parts.push(&buf[idx..end]);
        idx = end;
    }
    Ok(parts)
}
