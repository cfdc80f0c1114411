use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{CachePolicy, EvictionListener};
use crate::engine::cache::buffer_handle::{CacheBuffer, NO_POLICY_SLOT};

struct FifoInner {
    queue: BTreeMap<u64, Arc<CacheBuffer>>,
    next_seq: u64,
}

/// Insertion-ordered eviction: the oldest cached buffer goes first. Access
/// notifications are ignored.
pub struct FifoPolicy {
    inner: Mutex<FifoInner>,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FifoInner {
                queue: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

impl Default for FifoPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CachePolicy for FifoPolicy {
    fn cache(&self, buffer: &Arc<CacheBuffer>) {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        buffer.set_policy_slot(seq);
        inner.queue.insert(seq, Arc::clone(buffer));
    }

    fn notify_lock(&self, _buffer: &Arc<CacheBuffer>) {}

    fn notify_unlock(&self, _buffer: &Arc<CacheBuffer>) {}

    fn evict_some_blocks(&self, target: u64, listener: &dyn EvictionListener) -> u64 {
        let mut evicted = 0u64;
        // Victims are gathered under the policy lock and handed to the
        // listener only after it is released; the listener takes the index
        // and arena locks.
        let victims = {
            let mut inner = self.inner.lock().unwrap();
            let mut victims = Vec::new();
            let mut taken = Vec::new();
            for (&seq, buffer) in inner.queue.iter() {
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
                inner.queue.remove(&seq);
            }
            victims
        };

        debug!(
            target: "striadb::policy",
            target_bytes = target,
            evicted_bytes = evicted,
            victims = victims.len(),
            "FIFO eviction drain"
        );
        for victim in &victims {
            listener.notify_evicted(victim);
        }
        evicted
    }
}
