pub mod fifo_policy;
pub mod lru_policy;

pub use fifo_policy::FifoPolicy;
pub use lru_policy::LruPolicy;

use std::sync::Arc;

use crate::engine::cache::buffer_handle::CacheBuffer;
use crate::shared::config::model::PolicyKind;

/// Receives every buffer a policy invalidates during an eviction drain. The
/// allocator/index glue implements this; passing it into the drain (rather
/// than storing a back-pointer on the policy) keeps the dependency cycle
/// between allocator, policy, and index broken.
pub trait EvictionListener: Send + Sync {
    fn notify_evicted(&self, buffer: &Arc<CacheBuffer>);
}

/// Eviction order over cached buffers.
pub trait CachePolicy: Send + Sync {
    /// A handle entered the cached-range index.
    fn cache(&self, buffer: &Arc<CacheBuffer>);

    /// A lookup pinned the buffer.
    fn notify_lock(&self, buffer: &Arc<CacheBuffer>);

    /// A consumer released a pin.
    fn notify_unlock(&self, buffer: &Arc<CacheBuffer>);

    /// Walks candidates in policy order, invalidating cold buffers until
    /// `target` bytes are reclaimed or the candidates are exhausted. Pinned
    /// candidates are skipped; the return value may therefore fall short of
    /// the target, which callers treat as a transient shortage.
    fn evict_some_blocks(&self, target: u64, listener: &dyn EvictionListener) -> u64;
}

pub fn build_policy(kind: PolicyKind) -> Arc<dyn CachePolicy> {
    match kind {
        PolicyKind::Fifo => Arc::new(FifoPolicy::new()),
        PolicyKind::Lru => Arc::new(LruPolicy::new()),
    }
}
