use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, trace};

use super::buddy_allocator::BuddyAllocator;
use super::buffer_handle::CacheBuffer;
use super::memory_manager::MemoryManager;
use super::policy::{CachePolicy, EvictionListener, build_policy};
use super::range_map::{FileRanges, PutOutcome};
use super::ranges::{CacheChunk, DiskRange, FileId, push_gap};
use super::stats::{CacheStats, CacheStatsSnapshot};
use super::sweeper::StaleEntrySweeper;
use crate::engine::errors::CacheError;
use crate::shared::config::model::CacheConfig;

/// Conflict bitmask returned by `put_file_data`: bit `k` of word `k / 64` is
/// set when request index `k` collided with a live resident entry.
pub type ConflictMask = Vec<u64>;

/// The cached-range index plus the eviction glue: per-file ordered maps of
/// `[offset, end) -> buffer`, backed by the buddy allocator and drained by
/// the configured policy.
pub struct DataCache {
    files: RwLock<HashMap<FileId, Arc<FileRanges>>>,
    allocator: Arc<BuddyAllocator>,
    policy: Arc<dyn CachePolicy>,
    stats: Arc<CacheStats>,
}

impl DataCache {
    pub fn new(
        allocator: Arc<BuddyAllocator>,
        policy: Arc<dyn CachePolicy>,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            allocator,
            policy,
            stats,
        }
    }

    pub fn allocator(&self) -> &Arc<BuddyAllocator> {
        &self.allocator
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    fn file_ranges(&self, file: FileId, create: bool) -> Option<Arc<FileRanges>> {
        {
            let files = self.files.read().unwrap();
            if let Some(fr) = files.get(&file) {
                return Some(Arc::clone(fr));
            }
        }
        if !create {
            return None;
        }
        let mut files = self.files.write().unwrap();
        Some(Arc::clone(
            files.entry(file).or_insert_with(|| Arc::new(FileRanges::new())),
        ))
    }

    /// Resolves the gap entries of `ranges` against the cache, weaving the
    /// list in place into hits and remaining gaps. Offsets in `ranges` are
    /// stream-relative; `base_offset` translates them to file offsets for
    /// the index. Hit buffers come back pinned once per hit.
    pub fn get_file_data(&self, file: FileId, ranges: &mut Vec<CacheChunk>, base_offset: u64) {
        let input = std::mem::take(ranges);
        let mut out = Vec::with_capacity(input.len());
        let file_ranges = self.file_ranges(file, false);

        for chunk in input {
            match chunk {
                CacheChunk::Hit { .. } => out.push(chunk),
                CacheChunk::Gap(r) => match &file_ranges {
                    Some(fr) => fr.collect(
                        r.start + base_offset,
                        r.end + base_offset,
                        base_offset,
                        self.policy.as_ref(),
                        &self.stats,
                        &mut out,
                    ),
                    None => {
                        self.stats.record_miss();
                        push_gap(&mut out, r);
                    }
                },
            }
        }
        trace!(
            target: "striadb::index",
            file,
            chunks = out.len(),
            "Range lookup woven"
        );
        *ranges = out;
    }

    /// Registers `buffers[i]` under `ranges[i]` for each `i`. On a live
    /// conflict the resident buffer wins: the caller's pointer is overwritten
    /// with it (pinned), the corresponding mask bit is set, and the caller
    /// must return its duplicate to the allocator.
    pub fn put_file_data(
        &self,
        file: FileId,
        ranges: &[DiskRange],
        buffers: &mut [Arc<CacheBuffer>],
        base_offset: u64,
    ) -> Option<ConflictMask> {
        assert_eq!(
            ranges.len(),
            buffers.len(),
            "one buffer per range is required"
        );
        let fr = self
            .file_ranges(file, true)
            .expect("index creation cannot fail");

        let mut mask: Option<ConflictMask> = None;
        for (i, (range, buffer)) in ranges.iter().zip(buffers.iter_mut()).enumerate() {
            let abs = range.shifted(base_offset);
            match fr.put(file, abs, buffer, self.policy.as_ref()) {
                PutOutcome::Inserted => {}
                PutOutcome::ReplacedStale => {
                    debug!(
                        target: "striadb::index",
                        file,
                        start = abs.start,
                        "Replaced stale entry"
                    );
                }
                PutOutcome::ConflictLive => {
                    self.stats.record_conflict();
                    let words = mask.get_or_insert_with(|| vec![0u64; ranges.len().div_ceil(64)]);
                    words[i / 64] |= 1u64 << (i % 64);
                }
            }
        }
        mask
    }

    /// Drops one pin and lets the policy observe the release.
    pub fn release_buffer(&self, buffer: &Arc<CacheBuffer>) {
        let remaining = buffer.unpin();
        self.policy.notify_unlock(buffer);
        trace!(target: "striadb::index", remaining, "Buffer released");
    }

    /// Removes index entries whose buffers were invalidated but never
    /// unlinked (lookups treat them as misses in the meantime). Returns the
    /// number of entries dropped.
    pub fn sweep_stale(&self) -> usize {
        let snapshot: Vec<(FileId, Arc<FileRanges>)> = {
            let files = self.files.read().unwrap();
            files.iter().map(|(k, v)| (*k, Arc::clone(v))).collect()
        };
        let mut removed = 0;
        for (_, fr) in &snapshot {
            removed += fr.sweep_stale();
        }
        if removed > 0 {
            self.stats.record_swept(removed as u64);
            let mut files = self.files.write().unwrap();
            files.retain(|_, fr| !fr.is_empty());
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn file_entry(&self, file: FileId, start: u64) -> Option<Arc<CacheBuffer>> {
        self.file_ranges(file, false)?.buffer_at(start)
    }

    #[cfg(test)]
    pub(crate) fn file_entry_count(&self, file: FileId) -> usize {
        self.file_ranges(file, false).map_or(0, |fr| fr.len())
    }
}

impl EvictionListener for DataCache {
    /// Called by the policy's eviction drain after a successful invalidate:
    /// unlink the index entry, then hand the memory back to the allocator.
    fn notify_evicted(&self, buffer: &Arc<CacheBuffer>) {
        debug_assert!(buffer.is_invalidated());
        if let Some(key) = buffer.take_cached_key() {
            if let Some(fr) = self.file_ranges(key.file, false) {
                fr.remove_if_same(key.start, buffer);
            }
        }
        self.stats.record_eviction(buffer.alloc_len() as u64);
        self.allocator.deallocate(buffer);
    }
}

/// Fully wired cache: policy, memory manager, allocator, and index built
/// from one validated configuration.
pub struct CacheHandle {
    cache: Arc<DataCache>,
    allocator: Arc<BuddyAllocator>,
    memory: Arc<MemoryManager>,
    sweep_interval: Duration,
}

impl CacheHandle {
    pub fn build(cfg: &CacheConfig) -> Result<Self, CacheError> {
        cfg.validate()?;
        let stats = Arc::new(CacheStats::default());
        let policy = build_policy(cfg.policy_kind);
        let memory = Arc::new(MemoryManager::new(
            cfg.total_size as u64,
            cfg.reserve_attempts,
            Arc::clone(&policy),
        ));
        let allocator = Arc::new(BuddyAllocator::new(cfg, Arc::clone(&memory))?);
        let cache = Arc::new(DataCache::new(
            Arc::clone(&allocator),
            Arc::clone(&policy),
            stats,
        ));
        let listener: Arc<dyn EvictionListener> = Arc::clone(&cache) as _;
        memory.set_eviction_listener(Arc::downgrade(&listener));

        info!(
            target: "striadb::cache",
            policy = ?cfg.policy_kind,
            total_size = cfg.total_size,
            "Data cache initialized"
        );
        Ok(Self {
            cache,
            allocator,
            memory,
            sweep_interval: Duration::from_millis(cfg.sweep_interval_ms),
        })
    }

    pub fn cache(&self) -> &Arc<DataCache> {
        &self.cache
    }

    pub fn allocator(&self) -> &Arc<BuddyAllocator> {
        &self.allocator
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Starts the background stale-entry sweeper. The caller owns the handle;
    /// dropping it shuts the thread down.
    pub fn spawn_sweeper(&self) -> Option<StaleEntrySweeper> {
        if self.sweep_interval.is_zero() {
            return None;
        }
        Some(StaleEntrySweeper::spawn(
            Arc::clone(&self.cache),
            self.sweep_interval,
        ))
    }
}
