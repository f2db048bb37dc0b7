use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::watch;

use crate::store::{keys, SharedStore};

/// Live counters shared by the executor pool, the work stealer and the
/// autoscaler. Loops read them lock-free.
#[derive(Default)]
pub struct WorkerMetrics {
    pub tasks_processed: AtomicU64,
    pub queue_length: AtomicI64,
    pub active_executors: AtomicI64,
    pub idle_executors: AtomicI64,
}

impl WorkerMetrics {
    pub fn snapshot(&self, cpu_usage: f64, memory_usage: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            queue_length: self.queue_length.load(Ordering::Relaxed),
            tasks_processed: self.tasks_processed.load(Ordering::Relaxed),
            active_workers: self.active_executors.load(Ordering::Relaxed),
            idle_workers: self.idle_executors.load(Ordering::Relaxed),
            cpu_usage,
            memory_usage,
        }
    }
}

/// Point-in-time view of a worker, published to the shared store once per
/// second and kept as a 24 hour history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub queue_length: i64,
    pub tasks_processed: u64,
    pub active_workers: i64,
    pub idle_workers: i64,
    pub cpu_usage: f64,
    pub memory_usage: u64,
}

const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);
const HISTORY_WINDOW_SECS: i64 = 24 * 60 * 60;

/// Publishes a worker's metric snapshots to the shared store.
pub struct MetricsPublisher {
    worker_id: String,
    store: Arc<dyn SharedStore>,
    metrics: Arc<WorkerMetrics>,
}

impl MetricsPublisher {
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
        let mut interval = tokio::time::interval(PUBLISH_INTERVAL);
        let mut sys = System::new_all();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    sys.refresh_cpu();
                    sys.refresh_memory();
                    let cpu_usage = sys.global_cpu_info().cpu_usage() as f64;
                    let memory_usage = sys.used_memory();

                    let snapshot = self.metrics.snapshot(cpu_usage, memory_usage);
                    if let Err(e) = self.publish(&snapshot).await {
                        tracing::warn!("Failed to publish metrics: {}", e);
                    }
                }
            }
        }
    }

    async fn publish(&self, snapshot: &MetricsSnapshot) -> anyhow::Result<()> {
        let encoded = serde_json::to_string(snapshot)?;

        self.store
            .hash_set(keys::WORKER_METRICS, &self.worker_id, &encoded)
            .await?;

        let history_key = keys::worker_metrics_history(&self.worker_id);
        let now_secs = snapshot.timestamp.timestamp();
        self.store
            .zset_add(&history_key, &encoded, now_secs as f64)
            .await?;
        self.store
            .zset_trim_below(&history_key, (now_secs - HISTORY_WINDOW_SECS) as f64)
            .await
    }
}
