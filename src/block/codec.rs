//! On-disk layout of association blocks.
//!
//! ```text
//! capacity u32 | size u32 | from u32 | tos u32 * capacity | values f32 * capacity
//! ```
//!
//! The record length depends on capacity alone, so a block can be sized
//! from its first four bytes. Slots past `size` are zero padding.

use bytes::{Buf, BufMut, BytesMut};

use super::AssociationBlock;
use crate::storage::RecordCodec;
use crate::{Error, Result};

const FIXED_LEN: usize = 12;

/// Header slot holding the running total association count.
pub const TOTAL_ASSOCIATIONS_SLOT: usize = 0;

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockCodec;

impl BlockCodec {
    fn len_for_capacity(capacity: usize) -> usize {
        FIXED_LEN + capacity * 8
    }
}

impl RecordCodec for BlockCodec {
    type Record = AssociationBlock;
    const TYPE_TAG: u32 = 0xA550_0001;
    const META_SLOTS: usize = 1;
    const LEN_PREFIX: usize = 4;

    fn encoded_len(&self, block: &AssociationBlock) -> usize {
        Self::len_for_capacity(block.capacity())
    }

    fn stored_len(&self, mut prefix: &[u8]) -> Result<usize> {
        if prefix.len() < 4 {
            return Err(Error::format("block prefix shorter than 4 bytes"));
        }
        let capacity = prefix.get_u32_le() as usize;
        if capacity == 0 {
            return Err(Error::format("block record with zero capacity"));
        }
        Ok(Self::len_for_capacity(capacity))
    }

    fn encode(&self, block: &AssociationBlock, buf: &mut BytesMut) {
        let capacity = block.capacity();
        let padding = capacity - block.len();
        buf.reserve(Self::len_for_capacity(capacity));

        buf.put_u32_le(capacity as u32);
        buf.put_u32_le(block.len() as u32);
        buf.put_u32_le(block.from_key());
        for &to in block.tos() {
            buf.put_u32_le(to);
        }
        buf.put_bytes(0, padding * 4);
        for &value in block.values() {
            buf.put_f32_le(value);
        }
        buf.put_bytes(0, padding * 4);
    }

    fn decode(&self, bytes: &[u8]) -> Result<AssociationBlock> {
        if bytes.len() < FIXED_LEN {
            return Err(Error::format("block record truncated"));
        }
        let mut buf = bytes;
        let capacity = buf.get_u32_le() as usize;
        let size = buf.get_u32_le() as usize;
        let from = buf.get_u32_le();

        if bytes.len() < Self::len_for_capacity(capacity) || size > capacity {
            return Err(Error::format(format!(
                "block {}: size {} / capacity {} inconsistent with {} bytes",
                from,
                size,
                capacity,
                bytes.len()
            )));
        }

        let mut tos = Vec::with_capacity(capacity);
        for _ in 0..size {
            tos.push(buf.get_u32_le());
        }
        buf.advance((capacity - size) * 4);
        let mut values = Vec::with_capacity(capacity);
        for _ in 0..size {
            values.push(buf.get_f32_le());
        }

        AssociationBlock::from_parts(from, capacity, tos, values)
    }
}
