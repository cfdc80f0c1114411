use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::arena::Arena;
use super::buffer_handle::CacheBuffer;
use super::memory_manager::MemoryManager;
use crate::engine::errors::CacheError;
use crate::shared::config::model::CacheConfig;

/// Bounded rounds of (evict, retry) when the accounting admits a request but
/// no arena holds a block of the needed order.
const MAX_EVICTION_ROUNDS: u32 = 5;

/// Fixed-capacity allocator handing out power-of-two blocks from lazily
/// created arenas.
pub struct BuddyAllocator {
    min_alloc: usize,
    max_alloc: usize,
    arena_size: usize,
    min_alloc_log2: u32,
    arenas: Box<[OnceCell<Arena>]>,
    /// Number of arenas initialized so far; arenas are created in order.
    arena_count: AtomicUsize,
    /// Round-robin start position so concurrent allocations spread out.
    arena_hint: AtomicUsize,
    memory: Arc<MemoryManager>,
}

impl BuddyAllocator {
    pub fn new(cfg: &CacheConfig, memory: Arc<MemoryManager>) -> Result<Self, CacheError> {
        cfg.validate()?;
        let max_arenas = cfg.max_arenas();
        let arenas = (0..max_arenas)
            .map(|_| OnceCell::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        info!(
            target: "striadb::alloc",
            min_alloc = cfg.min_alloc,
            max_alloc = cfg.max_alloc,
            arena_size = cfg.arena_size,
            total_size = cfg.total_size,
            max_arenas,
            "Buddy allocator ready"
        );

        Ok(Self {
            min_alloc: cfg.min_alloc,
            max_alloc: cfg.max_alloc,
            arena_size: cfg.arena_size,
            min_alloc_log2: cfg.min_alloc.trailing_zeros(),
            arenas,
            arena_count: AtomicUsize::new(0),
            arena_hint: AtomicUsize::new(0),
            memory,
        })
    }

    pub fn min_alloc(&self) -> usize {
        self.min_alloc
    }

    pub fn max_alloc(&self) -> usize {
        self.max_alloc
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Placeholder handle to be backed later by `allocate_multiple`.
    pub fn create_unallocated(&self) -> Arc<CacheBuffer> {
        CacheBuffer::new_unallocated()
    }

    /// Backs every handle in `dest` with a block of the order covering
    /// `size`. All-or-nothing: on failure any blocks carved for this call are
    /// returned and the reservation is rolled back.
    pub fn allocate_multiple(
        &self,
        dest: &[Arc<CacheBuffer>],
        size: usize,
    ) -> Result<(), CacheError> {
        if dest.is_empty() {
            return Ok(());
        }
        if size == 0 || size > self.max_alloc {
            // Oversized requests fail before any eviction is attempted.
            return Err(CacheError::OutOfCapacity {
                requested: size,
                capacity: self.max_alloc,
            });
        }

        let alloc_len = size.next_power_of_two().max(self.min_alloc);
        let rel_order = (alloc_len.trailing_zeros() - self.min_alloc_log2) as u8;
        let total = (alloc_len * dest.len()) as u64;

        if !self.memory.reserve(total, true) {
            debug!(
                target: "striadb::alloc",
                requested = total,
                used = self.memory.used(),
                "Reservation failed after eviction"
            );
            return Err(CacheError::OutOfCapacity {
                requested: total as usize,
                capacity: self.memory.total_size() as usize,
            });
        }

        let mut filled = 0usize;
        while filled < dest.len() {
            let mut rounds = 0u32;
            loop {
                if let Some((arena_idx, offset, ptr)) = self.allocate_block(rel_order) {
                    dest[filled].assign(arena_idx, offset, alloc_len as u32, ptr);
                    filled += 1;
                    break;
                }
                // The accounting admitted us, so the bytes exist but are
                // fragmented or still held by evictable buffers. Ask for one
                // block's worth per missing slot and retry; coalescing on
                // free restores larger blocks.
                let missing = (dest.len() - filled) as u64;
                let evicted = self.memory.try_evict(alloc_len as u64 * missing);
                rounds += 1;
                if evicted == 0 || rounds >= MAX_EVICTION_ROUNDS {
                    warn!(
                        target: "striadb::alloc",
                        alloc_len,
                        filled,
                        requested = dest.len(),
                        "Allocation failed after eviction rounds"
                    );
                    self.rollback(&dest[..filled], (dest.len() - filled) as u64 * alloc_len as u64);
                    return Err(CacheError::OutOfCapacity {
                        requested: total as usize,
                        capacity: self.memory.total_size() as usize,
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns a block to its arena and releases the accounting.
    pub fn deallocate(&self, buffer: &Arc<CacheBuffer>) {
        let Some((arena_idx, offset, alloc_len)) = buffer.take_assignment() else {
            warn!(target: "striadb::alloc", "Deallocate of an unbacked buffer");
            return;
        };
        match self.arenas.get(arena_idx as usize).and_then(OnceCell::get) {
            Some(arena) => arena.deallocate(offset),
            None => {
                error!(
                    target: "striadb::alloc",
                    arena = arena_idx,
                    "Buffer names an arena that does not exist"
                );
                return;
            }
        }
        self.memory.release(alloc_len as u64);
    }

    fn rollback(&self, assigned: &[Arc<CacheBuffer>], unreserved: u64) {
        for buffer in assigned {
            self.deallocate(buffer);
        }
        if unreserved > 0 {
            self.memory.release(unreserved);
        }
    }

    /// One block from any arena, round-robin from the hint, creating the next
    /// arena lazily when every existing one is out of blocks.
    fn allocate_block(&self, rel_order: u8) -> Option<(u32, u32, NonNull<u8>)> {
        loop {
            let count = self.arena_count.load(Ordering::Acquire);
            if count > 0 {
                let start = self.arena_hint.fetch_add(1, Ordering::Relaxed);
                for k in 0..count {
                    let i = (start + k) % count;
                    let Some(arena) = self.arenas[i].get() else {
                        continue;
                    };
                    if let Some(offset) = arena.allocate(rel_order) {
                        return Some((i as u32, offset, arena.slice_ptr(offset)));
                    }
                }
            }
            if count >= self.arenas.len() {
                return None;
            }
            match self.arenas[count].get_or_try_init(|| {
                Arena::new(count as u32, self.arena_size, self.min_alloc, self.max_alloc)
            }) {
                Ok(_) => {
                    self.arena_count.fetch_max(count + 1, Ordering::AcqRel);
                }
                Err(e) => {
                    error!(target: "striadb::alloc", arena = count, error = %e, "Arena mapping failed");
                    return None;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn arena(&self, index: usize) -> Option<&Arena> {
        self.arenas.get(index).and_then(OnceCell::get)
    }
}

impl std::fmt::Debug for BuddyAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("min_alloc", &self.min_alloc)
            .field("max_alloc", &self.max_alloc)
            .field("arena_size", &self.arena_size)
            .field("arenas", &self.arena_count.load(Ordering::Relaxed))
            .finish()
    }
}
