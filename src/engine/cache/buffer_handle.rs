use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use super::ranges::FileId;

/// Sentinel arena index for a handle with no backing memory yet.
pub const NO_ARENA: u32 = u32::MAX;

/// Sentinel for a handle not currently tracked by the eviction policy.
pub const NO_POLICY_SLOT: u64 = u64::MAX;

const REFCOUNT_MASK: u64 = 0x0000_0000_FFFF_FFFF;
const FLAG_CACHED: u64 = 1 << 62;
const FLAG_INVALIDATED: u64 = 1 << 63;

/// Key under which a buffer is registered in the cached-range index. Kept on
/// the buffer itself so the eviction drain can unlink the entry without a
/// full index scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKey {
    pub file: FileId,
    pub start: u64,
    pub end: u64,
}

/// Refcounted descriptor of one power-of-two block inside an arena.
///
/// The state word packs the refcount with the cached and invalidated flags so
/// that `try_pin` and `try_invalidate` race through a single CAS: the policy
/// can never invalidate a buffer a lookup just pinned, and a lookup can never
/// pin a buffer the policy already invalidated.
pub struct CacheBuffer {
    arena: AtomicU32,
    offset: AtomicU32,
    alloc_len: AtomicU32,
    data_len: AtomicU32,
    data: AtomicPtr<u8>,
    state: AtomicU64,
    policy_slot: AtomicU64,
    cached_key: Mutex<Option<CacheKey>>,
}

impl CacheBuffer {
    /// Placeholder handle with no backing memory. The stream reader creates
    /// these up front so block identity exists before the batched allocation.
    /// The initial refcount of 1 is the producer's pin.
    pub fn new_unallocated() -> Arc<Self> {
        Arc::new(Self {
            arena: AtomicU32::new(NO_ARENA),
            offset: AtomicU32::new(0),
            alloc_len: AtomicU32::new(0),
            data_len: AtomicU32::new(0),
            data: AtomicPtr::new(std::ptr::null_mut()),
            state: AtomicU64::new(1),
            policy_slot: AtomicU64::new(NO_POLICY_SLOT),
            cached_key: Mutex::new(None),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(alloc_len: u32) -> Arc<Self> {
        let buffer = Self::new_unallocated();
        buffer.alloc_len.store(alloc_len, Ordering::Relaxed);
        buffer.data_len.store(alloc_len, Ordering::Relaxed);
        buffer
    }

    /// Binds the handle to a physical slice. Called by the allocator under
    /// the owning arena's lock.
    pub(crate) fn assign(&self, arena: u32, offset: u32, alloc_len: u32, data: NonNull<u8>) {
        debug_assert_eq!(
            self.arena.load(Ordering::Relaxed),
            NO_ARENA,
            "buffer already backed by an arena"
        );
        self.offset.store(offset, Ordering::Relaxed);
        self.alloc_len.store(alloc_len, Ordering::Relaxed);
        self.arena.store(arena, Ordering::Relaxed);
        self.data.store(data.as_ptr(), Ordering::Release);
    }

    /// Detaches the handle from its arena for deallocation. Returns `None` if
    /// the handle was never allocated or was already returned.
    pub(crate) fn take_assignment(&self) -> Option<(u32, u32, u32)> {
        let arena = self.arena.swap(NO_ARENA, Ordering::AcqRel);
        if arena == NO_ARENA {
            return None;
        }
        self.data.store(std::ptr::null_mut(), Ordering::Release);
        Some((
            arena,
            self.offset.load(Ordering::Relaxed),
            self.alloc_len.load(Ordering::Relaxed),
        ))
    }

    pub fn is_allocated(&self) -> bool {
        self.arena.load(Ordering::Acquire) != NO_ARENA
    }

    pub fn arena_index(&self) -> u32 {
        self.arena.load(Ordering::Acquire)
    }

    pub fn offset(&self) -> u32 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Power-of-two block size reserved in the arena.
    pub fn alloc_len(&self) -> usize {
        self.alloc_len.load(Ordering::Relaxed) as usize
    }

    /// Bytes of decoded content actually stored.
    pub fn data_len(&self) -> usize {
        self.data_len.load(Ordering::Acquire) as usize
    }

    pub(crate) fn set_data_len(&self, len: usize) {
        debug_assert!(len <= self.alloc_len());
        self.data_len.store(len as u32, Ordering::Release);
    }

    /// The decoded bytes. Valid only while the owning allocator is alive.
    pub fn bytes(&self) -> &[u8] {
        let ptr = self.data.load(Ordering::Acquire);
        assert!(!ptr.is_null(), "buffer has no backing memory");
        let len = self.data_len();
        // Safety: `assign` pointed `data` at `alloc_len` bytes inside a live
        // arena mapping and `data_len <= alloc_len`. Consumers only observe
        // the slice after the producer published it through the index lock.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    /// Copies `src` into the block and declares it as the content.
    ///
    /// The caller must be the sole writer: producers fill a buffer before
    /// publishing it through `put_file_data`, never after.
    pub fn fill(&self, src: &[u8]) {
        let ptr = self.data.load(Ordering::Acquire);
        assert!(!ptr.is_null(), "buffer has no backing memory");
        assert!(src.len() <= self.alloc_len(), "content exceeds block size");
        // Safety: the block holds `alloc_len` bytes and the producer holds
        // exclusive write access until publication.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), ptr, src.len()) };
        self.set_data_len(src.len());
    }

    /// Hands the writer a mutable view of the whole block. Same exclusivity
    /// contract as [`fill`](Self::fill); used for in-place decompression.
    pub(crate) fn write_with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let ptr = self.data.load(Ordering::Acquire);
        assert!(!ptr.is_null(), "buffer has no backing memory");
        // Safety: see `fill`; the producer is the only thread touching the
        // block until it is published.
        let slice = unsafe { std::slice::from_raw_parts_mut(ptr, self.alloc_len()) };
        f(slice)
    }

    /// Pins the buffer for use. Fails iff the buffer has been invalidated;
    /// eviction races lose to a concurrent pin.
    pub fn try_pin(&self) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state & FLAG_INVALIDATED != 0 {
                return false;
            }
            debug_assert!(state & REFCOUNT_MASK < REFCOUNT_MASK);
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Drops one pin and returns the remaining refcount.
    pub fn unpin(&self) -> u32 {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & REFCOUNT_MASK > 0, "unpin without a matching pin");
        ((prev - 1) & REFCOUNT_MASK) as u32
    }

    pub fn refcount(&self) -> u32 {
        (self.state.load(Ordering::Acquire) & REFCOUNT_MASK) as u32
    }

    pub fn is_invalidated(&self) -> bool {
        self.state.load(Ordering::Acquire) & FLAG_INVALIDATED != 0
    }

    pub fn is_cached(&self) -> bool {
        self.state.load(Ordering::Acquire) & FLAG_CACHED != 0
    }

    pub(crate) fn mark_cached(&self) {
        self.state.fetch_or(FLAG_CACHED, Ordering::AcqRel);
    }

    /// One-way transition from evictable-live to dead. Succeeds only when the
    /// refcount is zero and the sentinel is not yet set.
    pub fn try_invalidate(&self) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state & FLAG_INVALIDATED != 0 || state & REFCOUNT_MASK != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state | FLAG_INVALIDATED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    pub(crate) fn policy_slot(&self) -> u64 {
        self.policy_slot.load(Ordering::Relaxed)
    }

    pub(crate) fn set_policy_slot(&self, slot: u64) {
        self.policy_slot.store(slot, Ordering::Relaxed);
    }

    pub(crate) fn set_cached_key(&self, key: CacheKey) {
        *self.cached_key.lock().unwrap() = Some(key);
    }

    pub(crate) fn take_cached_key(&self) -> Option<CacheKey> {
        self.cached_key.lock().unwrap().take()
    }
}

impl std::fmt::Debug for CacheBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("CacheBuffer")
            .field("arena", &self.arena.load(Ordering::Relaxed))
            .field("offset", &self.offset.load(Ordering::Relaxed))
            .field("alloc_len", &self.alloc_len.load(Ordering::Relaxed))
            .field("data_len", &self.data_len.load(Ordering::Relaxed))
            .field("refcount", &(state & REFCOUNT_MASK))
            .field("cached", &(state & FLAG_CACHED != 0))
            .field("invalidated", &(state & FLAG_INVALIDATED != 0))
            .finish()
    }
}
