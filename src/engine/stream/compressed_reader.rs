use std::sync::Arc;

use tracing::{debug, trace};

use crate::engine::cache::buffer_handle::CacheBuffer;
use crate::engine::cache::data_cache::DataCache;
use crate::engine::cache::ranges::{CacheChunk, DiskRange, FileId};
use crate::engine::errors::StreamError;

use super::block_header::{BLOCK_HEADER_LEN, parse_block_header};
use super::chunk::StreamChunk;
use super::compression_codec::CompressionCodec;

/// Where one parsed block's compressed payload lives.
enum BlockData {
    /// Fully inside one raw chunk.
    Contiguous {
        chunk: usize,
        start: usize,
        len: usize,
    },
    /// Straddled chunk boundaries and was consolidated into a scratch copy.
    Consolidated(Vec<u8>),
}

struct PendingBlock {
    /// Stream-relative span of the block, header included.
    range: DiskRange,
    is_original: bool,
    buffer: Arc<CacheBuffer>,
    data: BlockData,
}

enum Slot {
    Done(CacheChunk),
    Pending(usize),
}

/// Materializes compression blocks out of a mixed raw/cached chunk list:
/// reuses hits, decodes gaps into freshly allocated cache buffers, and
/// registers the results with the cached-range index.
pub struct CompressedReader {
    cache: Arc<DataCache>,
    codec: Arc<dyn CompressionCodec>,
    /// Compression block size; no block may decompress past this.
    buffer_size: usize,
}

impl CompressedReader {
    pub fn new(cache: Arc<DataCache>, codec: Arc<dyn CompressionCodec>, buffer_size: usize) -> Self {
        Self {
            cache,
            codec,
            buffer_size,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Walks `[start, end)` of the stream (stream-relative offsets, same
    /// space as the chunk ranges), one compression block at a time. The
    /// returned hits follow block order; reused input hits keep the pins
    /// they arrived with, new blocks carry the producer's pin.
    pub fn read_compressed(
        &self,
        file: FileId,
        chunks: &[StreamChunk],
        start: u64,
        end: u64,
        base_offset: u64,
    ) -> Result<Vec<CacheChunk>, StreamError> {
        let mut idx = 0usize;
        while idx < chunks.len() && chunks[idx].range().end <= start {
            idx += 1;
        }
        if idx >= chunks.len() || start < chunks[idx].range().start {
            return Err(StreamError::InvalidSeek(start));
        }

        let mut pos = start;
        let mut slots: Vec<Slot> = Vec::new();
        let mut pending: Vec<PendingBlock> = Vec::new();

        while pos < end {
            while idx < chunks.len() && chunks[idx].range().end <= pos {
                idx += 1;
            }
            if idx >= chunks.len() {
                break;
            }
            let chunk_range = chunks[idx].range();
            if pos < chunk_range.start {
                // Hole in the supplied chunks; nothing further to parse.
                break;
            }

            match &chunks[idx] {
                StreamChunk::Cached { range, buffer } => {
                    // Cached blocks are whole; landing inside one means the
                    // seek was off a block boundary.
                    if pos != range.start {
                        return Err(StreamError::InvalidSeek(pos));
                    }
                    slots.push(Slot::Done(CacheChunk::Hit {
                        range: *range,
                        buffer: Arc::clone(buffer),
                    }));
                    pos = range.end;
                }
                StreamChunk::Raw { .. } => {
                    let mut header_bytes = [0u8; BLOCK_HEADER_LEN];
                    let copied = copy_from_chunks(chunks, idx, pos, &mut header_bytes);
                    if copied < BLOCK_HEADER_LEN {
                        return Err(StreamError::Truncated { offset: pos });
                    }
                    let header = parse_block_header(header_bytes, pos, self.buffer_size)?;

                    let payload_start = pos + BLOCK_HEADER_LEN as u64;
                    let block_end = payload_start + header.chunk_len as u64;
                    let data = if payload_start >= chunk_range.start && block_end <= chunk_range.end
                    {
                        BlockData::Contiguous {
                            chunk: idx,
                            start: (payload_start - chunk_range.start) as usize,
                            len: header.chunk_len,
                        }
                    } else {
                        // Block straddles chunk boundaries; consolidate.
                        let mut scratch = vec![0u8; header.chunk_len];
                        let copied = copy_from_chunks(chunks, idx, payload_start, &mut scratch);
                        if copied < header.chunk_len {
                            return Err(StreamError::Truncated { offset: pos });
                        }
                        BlockData::Consolidated(scratch)
                    };

                    slots.push(Slot::Pending(pending.len()));
                    pending.push(PendingBlock {
                        range: DiskRange::new(pos, block_end),
                        is_original: header.is_original,
                        buffer: self.cache.allocator().create_unallocated(),
                        data,
                    });
                    pos = block_end;
                }
            }
        }

        let buffers = self.decode_pending(file, chunks, &pending, base_offset)?;

        let out: Vec<CacheChunk> = slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Done(chunk) => chunk,
                Slot::Pending(i) => CacheChunk::Hit {
                    range: pending[i].range,
                    buffer: Arc::clone(&buffers[i]),
                },
            })
            .collect();

        debug!(
            target: "striadb::stream",
            file,
            start,
            end,
            blocks = out.len(),
            decoded = pending.len(),
            "Compressed stream materialized"
        );
        Ok(out)
    }

    /// One batched allocation for every parsed block, then decode and
    /// publish. On a publication conflict the resident buffer wins and our
    /// duplicate goes back to the allocator.
    fn decode_pending(
        &self,
        file: FileId,
        chunks: &[StreamChunk],
        pending: &[PendingBlock],
        base_offset: u64,
    ) -> Result<Vec<Arc<CacheBuffer>>, StreamError> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let handles: Vec<Arc<CacheBuffer>> =
            pending.iter().map(|p| Arc::clone(&p.buffer)).collect();
        self.cache
            .allocator()
            .allocate_multiple(&handles, self.buffer_size)?;

        for block in pending {
            let src: &[u8] = match &block.data {
                BlockData::Contiguous { chunk, start, len } => match &chunks[*chunk] {
                    StreamChunk::Raw { data, .. } => &data[*start..*start + *len],
                    StreamChunk::Cached { .. } => unreachable!("blocks parse from raw chunks"),
                },
                BlockData::Consolidated(bytes) => bytes,
            };
            let result = if block.is_original {
                block.buffer.fill(src);
                Ok(())
            } else {
                block
                    .buffer
                    .write_with(|dst| self.codec.decompress_into(src, dst))
                    .map(|written| block.buffer.set_data_len(written))
                    .map_err(|e| match e {
                        StreamError::BadFormat { reason, .. } => StreamError::BadFormat {
                            offset: block.range.start,
                            reason,
                        },
                        other => other,
                    })
            };
            if let Err(e) = result {
                // Nothing here was published; hand every block back.
                for block in pending {
                    self.cache.allocator().deallocate(&block.buffer);
                }
                e.log_error();
                return Err(e);
            }
        }

        let ranges: Vec<DiskRange> = pending.iter().map(|p| p.range).collect();
        let mut buffers = handles;
        if let Some(mask) = self
            .cache
            .put_file_data(file, &ranges, &mut buffers, base_offset)
        {
            for (i, block) in pending.iter().enumerate() {
                if mask[i / 64] >> (i % 64) & 1 == 1 {
                    trace!(
                        target: "striadb::stream",
                        file,
                        start = block.range.start,
                        "Concurrent producer won; dropping duplicate block"
                    );
                    self.cache.allocator().deallocate(&block.buffer);
                }
            }
        }
        Ok(buffers)
    }
}

/// Copies raw stream bytes starting at `pos` into `out`, crossing contiguous
/// raw chunks. Stops short at holes, cached chunks, or end of input; returns
/// the number of bytes copied.
fn copy_from_chunks(chunks: &[StreamChunk], mut idx: usize, mut pos: u64, out: &mut [u8]) -> usize {
    let mut copied = 0usize;
    while copied < out.len() && idx < chunks.len() {
        let StreamChunk::Raw { range, data } = &chunks[idx] else {
            break;
        };
        if pos >= range.end {
            idx += 1;
            continue;
        }
        if pos < range.start {
            break;
        }
        let off = (pos - range.start) as usize;
        let n = ((range.end - pos) as usize).min(out.len() - copied);
        out[copied..copied + n].copy_from_slice(&data[off..off + n]);
        copied += n;
        pos += n as u64;
    }
    copied
}
