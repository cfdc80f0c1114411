use std::io;
use std::sync::Arc;

use crate::engine::cache::buffer_handle::CacheBuffer;
use crate::engine::cache::ranges::{CacheChunk, DiskRange, FileId};

use super::source::SourceReader;

/// Input to the compressed stream reader: a contiguous run of the stream as
/// a mix of freshly read bytes and earlier cache hits.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Raw { range: DiskRange, data: Vec<u8> },
    Cached {
        range: DiskRange,
        buffer: Arc<CacheBuffer>,
    },
}

impl StreamChunk {
    pub fn range(&self) -> DiskRange {
        match self {
            StreamChunk::Raw { range, .. } => *range,
            StreamChunk::Cached { range, .. } => *range,
        }
    }
}

/// Turns a woven lookup result into stream input by reading every gap from
/// storage. Hits pass through with their pins intact.
pub fn resolve_gaps(
    source: &dyn SourceReader,
    file: FileId,
    chunks: Vec<CacheChunk>,
    base_offset: u64,
) -> io::Result<Vec<StreamChunk>> {
    let gaps: Vec<DiskRange> = chunks
        .iter()
        .filter_map(|c| match c {
            CacheChunk::Gap(r) => Some(r.shifted(base_offset)),
            CacheChunk::Hit { .. } => None,
        })
        .collect();
    let mut reads = source.read_ranges(file, &gaps)?.into_iter();

    Ok(chunks
        .into_iter()
        .map(|c| match c {
            CacheChunk::Gap(range) => StreamChunk::Raw {
                range,
                data: reads.next().expect("one read per gap"),
            },
            CacheChunk::Hit { range, buffer } => StreamChunk::Cached { range, buffer },
        })
        .collect())
}
