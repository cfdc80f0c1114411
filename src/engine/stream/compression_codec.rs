use crate::engine::errors::StreamError;

use lz4_flex::block::{compress as lz4_compress, decompress_into as lz4_decompress_into};

pub const ALGO_LZ4: u16 = 0x0001;

/// Decoder for the payload of one compression block. `decompress_into`
/// writes into the caller's block-sized buffer and reports the decoded
/// length.
pub trait CompressionCodec: Send + Sync {
    fn algo_id(&self) -> u16;
    fn compress(&self, input: &[u8]) -> Vec<u8>;
    fn decompress_into(&self, input: &[u8], output: &mut [u8]) -> Result<usize, StreamError>;
}

pub struct Lz4Codec;

impl CompressionCodec for Lz4Codec {
    fn algo_id(&self) -> u16 {
        ALGO_LZ4
    }

    fn compress(&self, input: &[u8]) -> Vec<u8> {
        lz4_compress(input)
    }

    fn decompress_into(&self, input: &[u8], output: &mut [u8]) -> Result<usize, StreamError> {
        lz4_decompress_into(input, output).map_err(|e| StreamError::BadFormat {
            offset: 0,
            reason: format!("lz4 decompress: {e}"),
        })
    }
}
