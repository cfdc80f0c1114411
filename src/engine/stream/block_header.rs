use crate::engine::errors::StreamError;

/// Size of the header preceding every compression block.
pub const BLOCK_HEADER_LEN: usize = 3;

/// Decoded 3-byte compression block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// The block payload is stored uncompressed (passthrough).
    pub is_original: bool,
    /// Payload length in bytes following the header.
    pub chunk_len: usize,
}

/// Parses the little-endian header `[b0 b1 b2]`: bit 0 of `b0` is the
/// passthrough flag, the remaining 23 bits the payload length.
pub fn parse_block_header(
    bytes: [u8; BLOCK_HEADER_LEN],
    offset: u64,
    buffer_size: usize,
) -> Result<BlockHeader, StreamError> {
    let [b0, b1, b2] = bytes;
    let chunk_len = ((b2 as usize) << 15) | ((b1 as usize) << 7) | ((b0 as usize) >> 1);
    if chunk_len == 0 {
        return Err(StreamError::BadFormat {
            offset,
            reason: "zero-length compression block".to_string(),
        });
    }
    if chunk_len > buffer_size {
        return Err(StreamError::BadFormat {
            offset,
            reason: format!("block length {} exceeds buffer size {}", chunk_len, buffer_size),
        });
    }
    Ok(BlockHeader {
        is_original: b0 & 0x01 != 0,
        chunk_len,
    })
}

/// Inverse of [`parse_block_header`]; used by stream writers and fixtures.
pub fn encode_block_header(is_original: bool, chunk_len: usize) -> [u8; BLOCK_HEADER_LEN] {
    debug_assert!(chunk_len < (1 << 23));
    let b0 = (((chunk_len & 0x7f) as u8) << 1) | is_original as u8;
    let b1 = ((chunk_len >> 7) & 0xff) as u8;
    let b2 = ((chunk_len >> 15) & 0xff) as u8;
    [b0, b1, b2]
}
