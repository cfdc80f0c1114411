use std::sync::Arc;

use crate::engine::cache::buffer_handle::CacheBuffer;
use crate::engine::cache::data_cache::CacheHandle;
use crate::engine::cache::ranges::{CacheChunk, DiskRange};
use crate::engine::errors::StreamError;
use crate::engine::stream::block_header::encode_block_header;
use crate::engine::stream::chunk::StreamChunk;
use crate::engine::stream::compressed_reader::CompressedReader;
use crate::engine::stream::compression_codec::{CompressionCodec, Lz4Codec};
use crate::shared::config::model::{CacheConfig, PolicyKind};

const FILE: u64 = 11;
const BUFFER_SIZE: usize = 64;

fn setup() -> (CacheHandle, CompressedReader) {
    let handle = CacheHandle::build(&CacheConfig {
        min_alloc: 8,
        max_alloc: 64,
        arena_size: 1024,
        total_size: 1024,
        policy_kind: PolicyKind::Fifo,
        reserve_attempts: 1,
        sweep_interval_ms: 0,
    })
    .unwrap();
    let reader = CompressedReader::new(
        Arc::clone(handle.cache()),
        Arc::new(Lz4Codec),
        BUFFER_SIZE,
    );
    (handle, reader)
}

fn compressed_block(payload: &[u8]) -> Vec<u8> {
    let compressed = Lz4Codec.compress(payload);
    assert!(compressed.len() <= BUFFER_SIZE, "fixture must fit one block");
    let mut out = encode_block_header(false, compressed.len()).to_vec();
    out.extend_from_slice(&compressed);
    out
}

fn original_block(payload: &[u8]) -> Vec<u8> {
    let mut out = encode_block_header(true, payload.len()).to_vec();
    out.extend_from_slice(payload);
    out
}

fn raw(start: u64, data: Vec<u8>) -> StreamChunk {
    let end = start + data.len() as u64;
    StreamChunk::Raw {
        range: DiskRange::new(start, end),
        data,
    }
}

fn hit_buffer(chunk: &CacheChunk) -> &Arc<CacheBuffer> {
    match chunk {
        CacheChunk::Hit { buffer, .. } => buffer,
        CacheChunk::Gap(r) => panic!("unexpected gap {r:?}"),
    }
}

#[test]
fn fresh_blocks_decode_in_order_and_enter_the_cache() {
    let (handle, reader) = setup();
    let payload_a = vec![b'a'; 48];
    let payload_b = vec![b'b'; 32];
    let block_a = compressed_block(&payload_a);
    let block_b = compressed_block(&payload_b);
    let split = block_a.len() as u64;

    let mut stream = block_a;
    stream.extend_from_slice(&block_b);
    let end = stream.len() as u64;
    let chunks = vec![raw(0, stream)];

    let out = reader.read_compressed(FILE, &chunks, 0, end, 0).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].range(), DiskRange::new(0, split));
    assert_eq!(out[1].range(), DiskRange::new(split, end));
    assert_eq!(hit_buffer(&out[0]).bytes(), &payload_a[..]);
    assert_eq!(hit_buffer(&out[1]).bytes(), &payload_b[..]);
    assert_eq!(hit_buffer(&out[0]).refcount(), 1, "producer pin only");

    assert_eq!(handle.cache().file_entry_count(FILE), 2);
    assert_eq!(handle.memory().used(), 128, "two block-sized buffers");
}

#[test]
fn passthrough_blocks_are_copied_verbatim() {
    let (_handle, reader) = setup();
    let payload = b"stored without compression".to_vec();
    let block = original_block(&payload);
    let end = block.len() as u64;
    let chunks = vec![raw(0, block)];

    let out = reader.read_compressed(FILE, &chunks, 0, end, 0).unwrap();
    assert_eq!(out.len(), 1);
    let buffer = hit_buffer(&out[0]);
    assert_eq!(buffer.bytes(), &payload[..]);
    assert_eq!(buffer.data_len(), payload.len());
}

#[test]
fn cached_blocks_are_reused_without_new_allocations() {
    let (handle, reader) = setup();
    let stream = compressed_block(&[b'x'; 40]);
    let end = stream.len() as u64;
    let first = reader
        .read_compressed(FILE, &vec![raw(0, stream)], 0, end, 0)
        .unwrap();
    let used_after_first = handle.memory().used();

    // A later scan probes the cache and feeds the hits straight back in.
    let mut probe = vec![CacheChunk::Gap(DiskRange::new(0, end))];
    handle.cache().get_file_data(FILE, &mut probe, 0);
    let chunks: Vec<StreamChunk> = probe
        .into_iter()
        .map(|c| match c {
            CacheChunk::Hit { range, buffer } => StreamChunk::Cached { range, buffer },
            CacheChunk::Gap(r) => panic!("expected full coverage, missing {r:?}"),
        })
        .collect();

    let second = reader.read_compressed(FILE, &chunks, 0, end, 0).unwrap();
    assert_eq!(second.len(), 1);
    assert!(Arc::ptr_eq(hit_buffer(&second[0]), hit_buffer(&first[0])));
    assert_eq!(handle.memory().used(), used_after_first);
    assert_eq!(handle.cache().file_entry_count(FILE), 1);
}

#[test]
fn concurrent_producer_conflicts_dedup_to_the_resident_block() {
    let (handle, reader) = setup();
    let payload_a = vec![b'a'; 48];
    let payload_b = vec![b'b'; 32];
    let block_a = compressed_block(&payload_a);
    let block_b = compressed_block(&payload_b);
    let split = block_a.len() as u64;
    let mut stream = block_a.clone();
    stream.extend_from_slice(&block_b);
    let end = stream.len() as u64;

    let first = reader
        .read_compressed(FILE, &vec![raw(0, stream)], 0, end, 0)
        .unwrap();

    // Re-read with block A supplied as a cache hit and block B as raw bytes;
    // B's publication collides with the resident entry.
    let chunks = vec![
        StreamChunk::Cached {
            range: DiskRange::new(0, split),
            buffer: Arc::clone(hit_buffer(&first[0])),
        },
        raw(split, block_b),
    ];
    let second = reader.read_compressed(FILE, &chunks, 0, end, 0).unwrap();

    assert_eq!(second.len(), 2);
    assert!(Arc::ptr_eq(hit_buffer(&second[0]), hit_buffer(&first[0])));
    assert!(
        Arc::ptr_eq(hit_buffer(&second[1]), hit_buffer(&first[1])),
        "duplicate block deduplicated to the resident buffer"
    );
    assert_eq!(handle.cache().stats().conflicts, 1);
    assert_eq!(handle.memory().used(), 128, "duplicate returned to the allocator");
    assert_eq!(hit_buffer(&second[1]).bytes(), &payload_b[..]);
}

#[test]
fn blocks_straddling_chunk_boundaries_are_consolidated() {
    let (_handle, reader) = setup();
    let payload = vec![b'z'; 56];
    let block = compressed_block(&payload);
    let end = block.len() as u64;
    let cut = block.len() / 2;

    let chunks = vec![
        raw(0, block[..cut].to_vec()),
        raw(cut as u64, block[cut..].to_vec()),
    ];
    let out = reader.read_compressed(FILE, &chunks, 0, end, 0).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(hit_buffer(&out[0]).bytes(), &payload[..]);
}

#[test]
fn oversized_block_length_is_bad_format() {
    let (handle, reader) = setup();
    let mut data = encode_block_header(false, BUFFER_SIZE + 1).to_vec();
    data.extend_from_slice(&[0u8; 70]);
    let end = data.len() as u64;

    let err = reader
        .read_compressed(FILE, &vec![raw(0, data)], 0, end, 0)
        .unwrap_err();
    assert!(matches!(err, StreamError::BadFormat { offset: 0, .. }));
    assert_eq!(handle.memory().used(), 0);
    assert_eq!(handle.cache().file_entry_count(FILE), 0);
}

#[test]
fn payload_cut_short_is_truncated() {
    let (handle, reader) = setup();
    let block = compressed_block(&[b'q'; 50]);
    let cut = block.len() - 4;
    let err = reader
        .read_compressed(FILE, &vec![raw(0, block[..cut].to_vec())], 0, block.len() as u64, 0)
        .unwrap_err();
    assert!(matches!(err, StreamError::Truncated { offset: 0 }));
    assert_eq!(handle.memory().used(), 0);
}

#[test]
fn garbage_payload_fails_decode_and_releases_every_block() {
    let (handle, reader) = setup();
    // Valid leading block, then a block whose payload is not lz4.
    let good = compressed_block(&[b'g'; 40]);
    let split = good.len() as u64;
    let mut bad = encode_block_header(false, 10).to_vec();
    bad.extend_from_slice(&[0xFF; 10]);

    let mut stream = good;
    stream.extend_from_slice(&bad);
    let end = stream.len() as u64;

    let err = reader
        .read_compressed(FILE, &vec![raw(0, stream)], 0, end, 0)
        .unwrap_err();
    match err {
        StreamError::BadFormat { offset, .. } => assert_eq!(offset, split),
        other => panic!("expected BadFormat, got {other:?}"),
    }
    assert_eq!(handle.memory().used(), 0, "partial batch fully rolled back");
    assert_eq!(handle.cache().file_entry_count(FILE), 0);
}

#[test]
fn seek_outside_the_supplied_chunks_is_invalid() {
    let (_handle, reader) = setup();
    let block = compressed_block(&[b's'; 20]);
    let chunks = vec![raw(10, block)];
    let err = reader.read_compressed(FILE, &chunks, 5, 40, 0).unwrap_err();
    assert!(matches!(err, StreamError::InvalidSeek(5)));
}

#[test]
fn seek_into_the_middle_of_a_cached_block_is_invalid() {
    let (_handle, reader) = setup();
    let buffer = CacheBuffer::new_for_tests(64);
    let chunks = vec![StreamChunk::Cached {
        range: DiskRange::new(0, 10),
        buffer,
    }];
    let err = reader.read_compressed(FILE, &chunks, 5, 10, 0).unwrap_err();
    assert!(matches!(err, StreamError::InvalidSeek(5)));
}

#[test]
fn end_to_end_scan_reads_gaps_from_storage_and_reuses_hits() {
    use crate::engine::stream::chunk::resolve_gaps;
    use crate::engine::stream::source::MmapSourceReader;

    let (handle, reader) = setup();
    let payload_a = vec![b'a'; 48];
    let payload_b = vec![b'b'; 32];
    let mut stream = compressed_block(&payload_a);
    stream.extend_from_slice(&compressed_block(&payload_b));
    let end = stream.len() as u64;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.dat");
    std::fs::write(&path, &stream).unwrap();
    let source = MmapSourceReader::new();
    source.open(FILE, &path).unwrap();

    // First scan: everything is a gap, read from storage and decoded.
    let mut probe = vec![CacheChunk::Gap(DiskRange::new(0, end))];
    handle.cache().get_file_data(FILE, &mut probe, 0);
    let chunks = resolve_gaps(&source, FILE, probe, 0).unwrap();
    let first = reader.read_compressed(FILE, &chunks, 0, end, 0).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(hit_buffer(&first[0]).bytes(), &payload_a[..]);

    // Second scan: the probe comes back as pure hits, nothing touches
    // storage, and the same buffers are served.
    let mut reprobe = vec![CacheChunk::Gap(DiskRange::new(0, end))];
    handle.cache().get_file_data(FILE, &mut reprobe, 0);
    assert!(reprobe.iter().all(|c| !c.is_gap()), "fully cached");
    let chunks = resolve_gaps(&source, FILE, reprobe, 0).unwrap();
    let second = reader.read_compressed(FILE, &chunks, 0, end, 0).unwrap();
    assert!(Arc::ptr_eq(hit_buffer(&second[0]), hit_buffer(&first[0])));
    assert!(Arc::ptr_eq(hit_buffer(&second[1]), hit_buffer(&first[1])));
    assert_eq!(handle.cache().stats().hits, 2);
}

#[test]
fn reading_stops_cleanly_when_the_input_runs_out() {
    let (_handle, reader) = setup();
    let block = compressed_block(&[b'e'; 24]);
    let have = block.len() as u64;
    // Caller asks past what the chunks cover; the available block decodes
    // and the walk ends at the input boundary.
    let out = reader
        .read_compressed(FILE, &vec![raw(0, block)], 0, have + 100, 0)
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].range(), DiskRange::new(0, have));
}
