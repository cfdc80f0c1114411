use std::sync::Arc;
use std::time::Duration;

use crate::engine::cache::data_cache::CacheHandle;
use crate::engine::cache::ranges::DiskRange;
use crate::engine::stream::block_header::encode_block_header;
use crate::engine::stream::chunk::StreamChunk;
use crate::engine::stream::compressed_reader::CompressedReader;
use crate::engine::stream::compression_codec::{CompressionCodec, Lz4Codec};
use crate::engine::stream::pipeline::{DecodePipeline, ReadTask};
use crate::shared::config::model::{CacheConfig, PolicyKind};

const BUFFER_SIZE: usize = 64;

fn reader() -> (CacheHandle, Arc<CompressedReader>) {
    let handle = CacheHandle::build(&CacheConfig {
        min_alloc: 8,
        max_alloc: 64,
        arena_size: 1024,
        total_size: 1024,
        policy_kind: PolicyKind::Lru,
        reserve_attempts: 1,
        sweep_interval_ms: 0,
    })
    .unwrap();
    let reader = Arc::new(CompressedReader::new(
        Arc::clone(handle.cache()),
        Arc::new(Lz4Codec),
        BUFFER_SIZE,
    ));
    (handle, reader)
}

fn task_for(file: u64, payload: &[u8]) -> (ReadTask, Vec<u8>) {
    let compressed = Lz4Codec.compress(payload);
    let mut stream = encode_block_header(false, compressed.len()).to_vec();
    stream.extend_from_slice(&compressed);
    let end = stream.len() as u64;
    (
        ReadTask {
            file,
            chunks: vec![StreamChunk::Raw {
                range: DiskRange::new(0, end),
                data: stream,
            }],
            start: 0,
            end,
            base_offset: 0,
        },
        payload.to_vec(),
    )
}

#[test]
fn submitted_tasks_resolve_in_order() {
    let (_handle, reader) = reader();
    let pipeline = DecodePipeline::spawn(Arc::clone(&reader), 4);

    let (task_a, payload_a) = task_for(1, &[b'a'; 40]);
    let (task_b, payload_b) = task_for(2, &[b'b'; 24]);
    let rx_a = pipeline.submit(task_a);
    let rx_b = pipeline.submit(task_b);

    let out_a = rx_a
        .recv_timeout(Duration::from_secs(5))
        .expect("worker responds")
        .expect("decode succeeds");
    let out_b = rx_b
        .recv_timeout(Duration::from_secs(5))
        .expect("worker responds")
        .expect("decode succeeds");

    match &out_a[0] {
        crate::engine::cache::ranges::CacheChunk::Hit { buffer, .. } => {
            assert_eq!(buffer.bytes(), &payload_a[..]);
        }
        other => panic!("expected hit, got {other:?}"),
    }
    match &out_b[0] {
        crate::engine::cache::ranges::CacheChunk::Hit { buffer, .. } => {
            assert_eq!(buffer.bytes(), &payload_b[..]);
        }
        other => panic!("expected hit, got {other:?}"),
    }
}

#[test]
fn decode_errors_travel_back_to_the_submitter() {
    let (_handle, reader) = reader();
    let pipeline = DecodePipeline::spawn(Arc::clone(&reader), 2);

    // Header claims more than the block size allows.
    let mut data = encode_block_header(false, BUFFER_SIZE + 1).to_vec();
    data.extend_from_slice(&[0u8; 70]);
    let end = data.len() as u64;
    let rx = pipeline.submit(ReadTask {
        file: 5,
        chunks: vec![StreamChunk::Raw {
            range: DiskRange::new(0, end),
            data,
        }],
        start: 0,
        end,
        base_offset: 0,
    });

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(result.is_err());
}

#[test]
fn dropping_the_pipeline_joins_the_worker() {
    let (_handle, reader) = reader();
    let pipeline = DecodePipeline::spawn(reader, 1);
    drop(pipeline);
    // Nothing to assert beyond a clean join; a hang here fails the test
    // through the harness timeout.
}
