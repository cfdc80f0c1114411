pub mod block_header;
pub mod chunk;
pub mod compressed_reader;
pub mod compression_codec;
pub mod pipeline;
pub mod source;

pub use block_header::{BLOCK_HEADER_LEN, BlockHeader, encode_block_header, parse_block_header};
pub use chunk::{StreamChunk, resolve_gaps};
pub use compressed_reader::CompressedReader;
pub use compression_codec::{ALGO_LZ4, CompressionCodec, Lz4Codec};
pub use pipeline::{DecodePipeline, ReadTask, TaskResult};
pub use source::{MmapSourceReader, SourceReader};

#[cfg(test)]
mod compressed_reader_test;
#[cfg(test)]
mod pipeline_test;
