use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Sender, bounded};
use tracing::{debug, info};

use super::data_cache::DataCache;

enum SweeperMessage {
    Shutdown,
}

/// Background thread that periodically unlinks invalidated index entries
/// that lookups have skipped but nobody removed.
pub struct StaleEntrySweeper {
    sender: Sender<SweeperMessage>,
    worker: Option<JoinHandle<()>>,
}

impl StaleEntrySweeper {
    pub fn spawn(cache: Arc<DataCache>, interval: Duration) -> Self {
        let (tx, rx) = bounded(1);
        info!(
            target: "striadb::sweeper",
            interval_ms = interval.as_millis() as u64,
            "Starting stale-entry sweeper"
        );

        let worker = std::thread::spawn(move || {
            loop {
                match rx.recv_timeout(interval) {
                    Ok(SweeperMessage::Shutdown) => break,
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                        let removed = cache.sweep_stale();
                        if removed > 0 {
                            debug!(
                                target: "striadb::sweeper",
                                removed,
                                "Swept stale index entries"
                            );
                        }
                    }
                    Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                }
            }
            info!(target: "striadb::sweeper", "Sweeper thread exited");
        });

        Self {
            sender: tx,
            worker: Some(worker),
        }
    }
}

impl Drop for StaleEntrySweeper {
    fn drop(&mut self) {
        let _ = self.sender.send(SweeperMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
