//! Work Stealing
//!
//! When a worker has idle executors it may rebalance load by moving tasks
//! out of a busier sibling's inbox into its own. The move is a
//! create-if-absent on the thief's inbox followed by a delete on the
//! source, so a task can never sit in two inboxes at once: if the
//! coordinator races the same task into the thief's inbox first, the
//! create fails and that task is abandoned.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

use crate::store::{keys, SharedStore};

use super::metrics::WorkerMetrics;

const STEAL_INTERVAL: Duration = Duration::from_secs(5);

/// Inbox depth above which a sibling becomes a stealing candidate.
const STEAL_THRESHOLD: u64 = 2;

pub struct WorkStealer {
    worker_id: String,
    store: Arc<dyn SharedStore>,
    metrics: Arc<WorkerMetrics>,
}

impl WorkStealer {
    pub fn new(
        worker_id: String,
        store: Arc<dyn SharedStore>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            worker_id,
            store,
            metrics,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(STEAL_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    if self.metrics.idle_executors.load(Ordering::Relaxed) > 0 {
                        if let Err(e) = self.attempt_steal().await {
                            tracing::warn!("Work stealing attempt failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    pub(crate) async fn attempt_steal(&self) -> Result<()> {
        let workers = self.store.hash_all(keys::WORKERS).await?;

        for worker_id in workers.keys() {
            if *worker_id == self.worker_id {
                continue;
            }

            let inbox_key = keys::worker_inbox(worker_id);
            let depth = match self.store.hash_len(&inbox_key).await {
                Ok(depth) => depth,
                Err(_) => continue,
            };

            if depth > STEAL_THRESHOLD {
                self.steal_from(worker_id, &inbox_key).await;
            }
        }

        Ok(())
    }

    pub(crate) async fn steal_from(&self, target_worker: &str, source_inbox: &str) {
        let Ok(tasks) = self.store.hash_all(source_inbox).await else {
            return;
        };

        let steal_count = tasks.len() / 2;
        let own_inbox = keys::worker_inbox(&self.worker_id);
        let mut stolen = 0;

        for (task_id, raw) in &tasks {
            if stolen >= steal_count {
                break;
            }

            match self.store.hash_set_nx(&own_inbox, task_id, raw).await {
                Ok(true) => {
                    // Now owned here; the source copy is stale.
                    if let Err(e) = self.store.hash_del(source_inbox, task_id).await {
                        tracing::warn!(
                            "Failed to remove stolen task {} from {}: {}",
                            task_id,
                            target_worker,
                            e
                        );
                    }
                    stolen += 1;
                }
                Ok(false) => {
                    // Lost the race for this task id; leave it alone.
                    tracing::trace!("Task {} already present locally, skipping", task_id);
                }
                Err(e) => {
                    tracing::warn!("Failed to steal task {}: {}", task_id, e);
                }
            }
        }

        if stolen > 0 {
            tracing::info!(
                "Stole {} task(s) from worker {}",
                stolen,
                target_worker
            );
        }
    }
}
