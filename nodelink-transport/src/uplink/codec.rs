//! Block framing on the uplink stream.
//!
//! Block format: `[length:4][checksum:4][channel_id:8][priority:1][type:1][payload:N]`
//!
//! - **length**: total block size including header (little-endian u32)
//! - **checksum**: CRC32C of everything after the checksum field
//! - **channel_id**: logical channel (little-endian u64)
//! - **priority** / **type**: enum tags

use super::{
    MessageBlock, MessageBlockPriority, MessageBlockType, MessageBlockWithMetadata, UplinkError,
};
use crate::wire::{MAX_PAYLOAD_SIZE, WireError};

/// Header size: 4 + 4 + 8 + 1 + 1 = 18 bytes.
pub const BLOCK_HEADER_SIZE: usize = 18;

/// Encode one block.
///
/// # Errors
///
/// Returns `Wire(FrameTooLarge)` if the payload exceeds the frame limit.
pub fn encode_block(block: &MessageBlockWithMetadata) -> Result<Vec<u8>, UplinkError> {
    let payload = &block.block.payload;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge { size: payload.len() }.into());
    }
    let total_length = BLOCK_HEADER_SIZE + payload.len();
    let mut data = Vec::with_capacity(total_length);
    data.extend_from_slice(&(total_length as u32).to_le_bytes());
    data.extend_from_slice(&[0; 4]);
    data.extend_from_slice(&block.channel_id.to_le_bytes());
    data.push(block.priority as u8);
    data.push(block.block.block_type as u8);
    data.extend_from_slice(payload);
    let checksum = crc32c::crc32c(&data[8..]);
    data[4..8].copy_from_slice(&checksum.to_le_bytes());
    Ok(data)
}

/// Decode the first block in `data` if it is complete.
///
/// Returns the block and the number of bytes consumed, or `None` when more
/// data is needed.
///
/// # Errors
///
/// Returns an error for invalid lengths, checksum mismatches and unknown tags.
pub fn try_decode_block(
    data: &[u8],
) -> Result<Option<(MessageBlockWithMetadata, usize)>, UplinkError> {
    if data.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let total = length as usize;
    if total < BLOCK_HEADER_SIZE || total - BLOCK_HEADER_SIZE > MAX_PAYLOAD_SIZE {
        return Err(WireError::InvalidLength { length }.into());
    }
    if data.len() < total {
        return Ok(None);
    }

    let expected = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let actual = crc32c::crc32c(&data[8..total]);
    if expected != actual {
        return Err(WireError::ChecksumMismatch { expected, actual }.into());
    }

    let mut channel_id = [0u8; 8];
    channel_id.copy_from_slice(&data[8..16]);
    let priority = MessageBlockPriority::try_from(data[16])?;
    let block_type = MessageBlockType::try_from(data[17])?;
    let block = MessageBlockWithMetadata::new(
        MessageBlock::new(block_type, &data[BLOCK_HEADER_SIZE..total]),
        u64::from_le_bytes(channel_id),
        priority,
    );
    Ok(Some((block, total)))
}
