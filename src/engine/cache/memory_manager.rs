use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use super::policy::{CachePolicy, EvictionListener};

/// Global capacity accounting. Arbitrates between the allocator's need for
/// fresh blocks and the policy's obligation to evict cold ones.
pub struct MemoryManager {
    total_size: u64,
    used: AtomicU64,
    policy: Arc<dyn CachePolicy>,
    /// Set once during wiring; weak so the listener (which owns the
    /// allocator) does not form a reference cycle through us.
    listener: OnceCell<Weak<dyn EvictionListener>>,
    reserve_attempts: u32,
}

impl MemoryManager {
    pub fn new(total_size: u64, reserve_attempts: u32, policy: Arc<dyn CachePolicy>) -> Self {
        Self {
            total_size,
            used: AtomicU64::new(0),
            policy,
            listener: OnceCell::new(),
            reserve_attempts,
        }
    }

    pub fn set_eviction_listener(&self, listener: Weak<dyn EvictionListener>) {
        if self.listener.set(listener).is_err() {
            warn!(target: "striadb::memory", "Eviction listener already registered");
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Accounts `bytes` against the capacity, evicting through the policy on
    /// shortfall. With `wait_for_eviction` the reservation retries a bounded
    /// number of rounds, yielding between them; without it a single eviction
    /// pass decides.
    pub fn reserve(&self, bytes: u64, wait_for_eviction: bool) -> bool {
        for attempt in 0..=self.reserve_attempts {
            if self.try_reserve_fast(bytes) {
                return true;
            }
            let used = self.used.load(Ordering::Acquire);
            let shortfall = (used + bytes).saturating_sub(self.total_size);
            let evicted = self.try_evict(shortfall.max(1));
            if self.try_reserve_fast(bytes) {
                return true;
            }
            if !wait_for_eviction {
                return false;
            }
            if evicted == 0 {
                debug!(
                    target: "striadb::memory",
                    bytes,
                    attempt,
                    "Reservation stalled, nothing evictable"
                );
                std::thread::yield_now();
            }
        }
        false
    }

    /// Releases previously reserved bytes.
    pub fn release(&self, bytes: u64) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "releasing more memory than reserved");
    }

    /// Direct eviction request, used by the allocator when the accounting is
    /// fine but no arena holds a block of the needed order.
    pub fn try_evict(&self, target: u64) -> u64 {
        let Some(listener) = self.listener.get().and_then(Weak::upgrade) else {
            return 0;
        };
        self.policy.evict_some_blocks(target, listener.as_ref())
    }

    fn try_reserve_fast(&self, bytes: u64) -> bool {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            if used + bytes > self.total_size {
                return false;
            }
            match self.used.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("total_size", &self.total_size)
            .field("used", &self.used())
            .finish()
    }
}
