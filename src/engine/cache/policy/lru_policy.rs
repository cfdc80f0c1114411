use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{CachePolicy, EvictionListener};
use crate::engine::cache::buffer_handle::{CacheBuffer, NO_POLICY_SLOT};

struct LruInner {
    /// Eviction order, coldest first. The key is the slot stored on the
    /// buffer, so reordering never needs a secondary lookup map.
    list: BTreeMap<u64, Arc<CacheBuffer>>,
    next_seq: u64,
}

impl LruInner {
    fn detach(&mut self, buffer: &Arc<CacheBuffer>) {
        let slot = buffer.policy_slot();
        if slot != NO_POLICY_SLOT {
            self.list.remove(&slot);
            buffer.set_policy_slot(NO_POLICY_SLOT);
        }
    }

    fn attach_at_tail(&mut self, buffer: &Arc<CacheBuffer>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        buffer.set_policy_slot(seq);
        self.list.insert(seq, Arc::clone(buffer));
    }
}

/// Recency-ordered eviction. Pinned buffers are detached into an implicit
/// hot set so pin bursts do not churn the order; each unpin re-attaches the
/// buffer at the tail.
pub struct LruPolicy {
    inner: Mutex<LruInner>,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruInner {
                list: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().list.len()
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CachePolicy for LruPolicy {
    fn cache(&self, buffer: &Arc<CacheBuffer>) {
        let mut inner = self.inner.lock().unwrap();
        inner.attach_at_tail(buffer);
    }

    fn notify_lock(&self, buffer: &Arc<CacheBuffer>) {
        let mut inner = self.inner.lock().unwrap();
        inner.detach(buffer);
    }

    fn notify_unlock(&self, buffer: &Arc<CacheBuffer>) {
        if !buffer.is_cached() || buffer.is_invalidated() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.detach(buffer);
        inner.attach_at_tail(buffer);
    }

    fn evict_some_blocks(&self, target: u64, listener: &dyn EvictionListener) -> u64 {
        let mut evicted = 0u64;
        let victims = {
            let mut inner = self.inner.lock().unwrap();
            let mut victims = Vec::new();
            let mut taken = Vec::new();
            for (&seq, buffer) in inner.list.iter() {
                if evicted >= target {
                    break;
                }
                if buffer.try_invalidate() {
                    evicted += buffer.alloc_len() as u64;
                    buffer.set_policy_slot(NO_POLICY_SLOT);
                    victims.push(Arc::clone(buffer));
                    taken.push(seq);
                }
            }
            for seq in taken {
                inner.list.remove(&seq);
            }
            victims
        };

        debug!(
            target: "striadb::policy",
            target_bytes = target,
            evicted_bytes = evicted,
            victims = victims.len(),
            "LRU eviction drain"
        );
        for victim in &victims {
            listener.notify_evicted(victim);
        }
        evicted
    }
}
