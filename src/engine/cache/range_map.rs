use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::{Arc, RwLock};

use tracing::trace;

use super::buffer_handle::{CacheBuffer, CacheKey};
use super::policy::CachePolicy;
use super::ranges::{CacheChunk, DiskRange, FileId, push_gap};
use super::stats::CacheStats;

#[derive(Debug)]
struct RangeEntry {
    end: u64,
    buffer: Arc<CacheBuffer>,
}

/// Outcome of caching one range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutOutcome {
    Inserted,
    /// A live entry already covers this start; the caller's pointer was
    /// swapped for the resident buffer.
    ConflictLive,
    /// The resident entry was invalidated; it was replaced silently.
    ReplacedStale,
}

/// Ordered map of cached ranges for one file, keyed by absolute start
/// offset. Live entries cover disjoint intervals.
pub struct FileRanges {
    inner: RwLock<BTreeMap<u64, RangeEntry>>,
}

impl FileRanges {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    /// Weaves cached entries into the probe `[qs, qe)` (absolute offsets),
    /// appending hits and gaps to `out` in caller coordinates (minus `base`).
    /// Every hit pins its buffer once; invalidated entries read as absent.
    pub(crate) fn collect(
        &self,
        qs: u64,
        qe: u64,
        base: u64,
        policy: &dyn CachePolicy,
        stats: &CacheStats,
        out: &mut Vec<CacheChunk>,
    ) {
        let map = self.inner.read().unwrap();
        let mut pos = qs;

        // Entry with the greatest start <= qs may reach into the probe.
        let head = map
            .range((Unbounded, Excluded(qs.saturating_add(1))))
            .next_back()
            .filter(|(_, e)| e.end > qs);
        let tail = map.range((Excluded(qs), Excluded(qe)));

        for (&start, entry) in head.into_iter().chain(tail) {
            let s = start.max(qs);
            let e = entry.end.min(qe);
            if e <= pos {
                continue;
            }
            if !entry.buffer.try_pin() {
                // Stale entry awaiting removal; its bytes count as a gap.
                trace!(target: "striadb::index", start, "Skipping invalidated entry");
                continue;
            }
            policy.notify_lock(&entry.buffer);
            stats.record_hit();
            if pos < s {
                stats.record_miss();
                push_gap(out, DiskRange::new(pos - base, s - base));
            }
            out.push(CacheChunk::Hit {
                range: DiskRange::new(s - base, e - base),
                buffer: Arc::clone(&entry.buffer),
            });
            pos = e;
        }

        if pos < qe {
            stats.record_miss();
            push_gap(out, DiskRange::new(pos - base, qe - base));
        }
    }

    /// Caches `buffer` under `[range.start, range.end)` (absolute offsets).
    /// On a live conflict the caller's pointer is replaced with the resident
    /// buffer, pinned once for the caller.
    pub(crate) fn put(
        &self,
        file: FileId,
        range: DiskRange,
        buffer: &mut Arc<CacheBuffer>,
        policy: &dyn CachePolicy,
    ) -> PutOutcome {
        let mut map = self.inner.write().unwrap();
        if let Some(entry) = map.get_mut(&range.start) {
            if entry.buffer.try_pin() {
                policy.notify_lock(&entry.buffer);
                *buffer = Arc::clone(&entry.buffer);
                return PutOutcome::ConflictLive;
            }
            // Resident entry lost an eviction race; replace it silently.
            entry.buffer.take_cached_key();
            let incoming = Arc::clone(buffer);
            incoming.set_cached_key(CacheKey {
                file,
                start: range.start,
                end: range.end,
            });
            incoming.mark_cached();
            policy.cache(&incoming);
            *entry = RangeEntry {
                end: range.end,
                buffer: incoming,
            };
            return PutOutcome::ReplacedStale;
        }

        debug_assert!(
            map.range((Unbounded, Excluded(range.start)))
                .next_back()
                .map_or(true, |(_, e)| e.end <= range.start)
                && map
                    .range((Excluded(range.start), Unbounded))
                    .next()
                    .map_or(true, |(&s, _)| s >= range.end),
            "cached intervals must stay disjoint"
        );

        buffer.set_cached_key(CacheKey {
            file,
            start: range.start,
            end: range.end,
        });
        buffer.mark_cached();
        policy.cache(buffer);
        map.insert(
            range.start,
            RangeEntry {
                end: range.end,
                buffer: Arc::clone(buffer),
            },
        );
        PutOutcome::Inserted
    }

    /// Unlinks the entry at `start` if it still references `buffer`.
    pub(crate) fn remove_if_same(&self, start: u64, buffer: &Arc<CacheBuffer>) -> bool {
        let mut map = self.inner.write().unwrap();
        match map.get(&start) {
            Some(entry) if Arc::ptr_eq(&entry.buffer, buffer) => {
                map.remove(&start);
                true
            }
            _ => false,
        }
    }

    /// Drops every entry whose buffer has been invalidated. Returns the
    /// number of entries removed.
    pub(crate) fn sweep_stale(&self) -> usize {
        let mut map = self.inner.write().unwrap();
        let stale: Vec<u64> = map
            .iter()
            .filter(|(_, e)| e.buffer.is_invalidated())
            .map(|(&s, _)| s)
            .collect();
        for start in &stale {
            if let Some(entry) = map.remove(start) {
                entry.buffer.take_cached_key();
            }
        }
        stale.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn buffer_at(&self, start: u64) -> Option<Arc<CacheBuffer>> {
        self.inner
            .read()
            .unwrap()
            .get(&start)
            .map(|e| Arc::clone(&e.buffer))
    }
}

impl Default for FileRanges {
    fn default() -> Self {
        Self::new()
    }
}
