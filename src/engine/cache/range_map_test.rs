use std::sync::Arc;

use crate::engine::cache::buffer_handle::CacheBuffer;
use crate::engine::cache::policy::{CachePolicy, FifoPolicy};
use crate::engine::cache::range_map::{FileRanges, PutOutcome};
use crate::engine::cache::ranges::{CacheChunk, DiskRange};
use crate::engine::cache::stats::CacheStats;

const FILE: u64 = 42;

fn put(
    fr: &FileRanges,
    policy: &dyn CachePolicy,
    start: u64,
    end: u64,
    buffer: &Arc<CacheBuffer>,
) -> PutOutcome {
    let mut handle = Arc::clone(buffer);
    fr.put(FILE, DiskRange::new(start, end), &mut handle, policy)
}

fn collect(fr: &FileRanges, policy: &dyn CachePolicy, qs: u64, qe: u64) -> Vec<CacheChunk> {
    let stats = CacheStats::default();
    let mut out = Vec::new();
    fr.collect(qs, qe, 0, policy, &stats, &mut out);
    out
}

#[test]
fn probe_weaves_hits_and_gaps_in_order() {
    let fr = FileRanges::new();
    let policy = FifoPolicy::new();
    let b0 = CacheBuffer::new_for_tests(2);
    let b1 = CacheBuffer::new_for_tests(2);
    assert_eq!(put(&fr, &policy, 2, 4, &b0), PutOutcome::Inserted);
    assert_eq!(put(&fr, &policy, 6, 8, &b1), PutOutcome::Inserted);

    let out = collect(&fr, &policy, 1, 9);
    assert_eq!(out.len(), 5);
    match &out[0] {
        CacheChunk::Gap(r) => assert_eq!(*r, DiskRange::new(1, 2)),
        _ => panic!("expected leading gap"),
    }
    match &out[1] {
        CacheChunk::Hit { range, buffer } => {
            assert_eq!(*range, DiskRange::new(2, 4));
            assert!(Arc::ptr_eq(buffer, &b0));
        }
        _ => panic!("expected hit on b0"),
    }
    match &out[2] {
        CacheChunk::Gap(r) => assert_eq!(*r, DiskRange::new(4, 6)),
        _ => panic!("expected interior gap"),
    }
    match &out[3] {
        CacheChunk::Hit { range, buffer } => {
            assert_eq!(*range, DiskRange::new(6, 8));
            assert!(Arc::ptr_eq(buffer, &b1));
        }
        _ => panic!("expected hit on b1"),
    }
    match &out[4] {
        CacheChunk::Gap(r) => assert_eq!(*r, DiskRange::new(8, 9)),
        _ => panic!("expected trailing gap"),
    }

    // Exactly one pin per hit on top of the producer pin.
    assert_eq!(b0.refcount(), 2);
    assert_eq!(b1.refcount(), 2);
}

#[test]
fn entries_spanning_the_probe_are_split_not_merged() {
    let fr = FileRanges::new();
    let policy = FifoPolicy::new();
    let buffer = CacheBuffer::new_for_tests(8);
    put(&fr, &policy, 0, 8, &buffer);

    let out = collect(&fr, &policy, 2, 5);
    assert_eq!(out.len(), 1);
    match &out[0] {
        CacheChunk::Hit { range, .. } => assert_eq!(*range, DiskRange::new(2, 5)),
        _ => panic!("interior probe should hit"),
    }
    assert_eq!(buffer.refcount(), 2, "split hit pins once");
}

#[test]
fn base_offset_translates_between_coordinate_spaces() {
    let fr = FileRanges::new();
    let policy = FifoPolicy::new();
    let buffer = CacheBuffer::new_for_tests(4);
    // Entry stored at absolute offsets [102, 106).
    put(&fr, &policy, 102, 106, &buffer);

    let stats = CacheStats::default();
    let mut out = Vec::new();
    fr.collect(100, 108, 100, &policy, &stats, &mut out);
    assert_eq!(out.len(), 3);
    assert_eq!(out[1].range(), DiskRange::new(2, 6), "output in caller coordinates");
}

#[test]
fn invalidated_entries_read_as_gaps() {
    let fr = FileRanges::new();
    let policy = FifoPolicy::new();
    let buffer = CacheBuffer::new_for_tests(4);
    put(&fr, &policy, 0, 4, &buffer);

    buffer.unpin();
    assert!(buffer.try_invalidate());

    let out = collect(&fr, &policy, 0, 4);
    assert_eq!(out.len(), 1);
    assert!(out[0].is_gap(), "stale entry must not surface as a hit");
    assert_eq!(out[0].range(), DiskRange::new(0, 4));
}

#[test]
fn live_conflict_swaps_the_callers_pointer() {
    let fr = FileRanges::new();
    let policy = FifoPolicy::new();
    let resident = CacheBuffer::new_for_tests(4);
    put(&fr, &policy, 0, 4, &resident);

    let duplicate = CacheBuffer::new_for_tests(4);
    let mut handle = Arc::clone(&duplicate);
    let outcome = fr.put(FILE, DiskRange::new(0, 4), &mut handle, &policy);
    assert_eq!(outcome, PutOutcome::ConflictLive);
    assert!(Arc::ptr_eq(&handle, &resident), "caller now holds the winner");
    assert_eq!(resident.refcount(), 2, "winner pinned for the caller");
    assert_eq!(duplicate.refcount(), 1, "loser untouched, caller releases it");
}

#[test]
fn stale_entries_are_replaced_silently() {
    let fr = FileRanges::new();
    let policy = FifoPolicy::new();
    let stale = CacheBuffer::new_for_tests(4);
    put(&fr, &policy, 0, 4, &stale);
    stale.unpin();
    assert!(stale.try_invalidate());

    let fresh = CacheBuffer::new_for_tests(4);
    assert_eq!(put(&fr, &policy, 0, 4, &fresh), PutOutcome::ReplacedStale);
    assert!(Arc::ptr_eq(&fr.buffer_at(0).unwrap(), &fresh));
    assert_eq!(fr.len(), 1);
}

#[test]
fn remove_if_same_only_unlinks_the_matching_buffer() {
    let fr = FileRanges::new();
    let policy = FifoPolicy::new();
    let buffer = CacheBuffer::new_for_tests(4);
    put(&fr, &policy, 0, 4, &buffer);

    let other = CacheBuffer::new_for_tests(4);
    assert!(!fr.remove_if_same(0, &other));
    assert_eq!(fr.len(), 1);

    assert!(fr.remove_if_same(0, &buffer));
    assert_eq!(fr.len(), 0);
}

#[test]
fn sweep_drops_only_invalidated_entries() {
    let fr = FileRanges::new();
    let policy = FifoPolicy::new();
    let live = CacheBuffer::new_for_tests(4);
    let dead = CacheBuffer::new_for_tests(4);
    put(&fr, &policy, 0, 4, &live);
    put(&fr, &policy, 4, 8, &dead);

    dead.unpin();
    assert!(dead.try_invalidate());

    assert_eq!(fr.sweep_stale(), 1);
    assert_eq!(fr.len(), 1);
    assert!(fr.buffer_at(0).is_some());
    assert!(fr.buffer_at(4).is_none());
}
