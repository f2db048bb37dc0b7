use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::store::{keys, SharedStore};
use crate::worker::MetricsSnapshot;

use super::protocol::{SystemMetrics, WorkerInfo};

/// Heartbeat age past which a worker is reported `inactive`.
const INACTIVE_AFTER_SECS: i64 = 30;

/// Read-only aggregation over the shared store. The probe never mutates
/// state; it is safe to run alongside any number of coordinators and
/// workers.
pub struct MetricsProbe {
    store: Arc<dyn SharedStore>,
}

impl MetricsProbe {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub async fn collect(&self) -> Result<SystemMetrics> {
        let mut queue_lengths = HashMap::new();
        let mut total_tasks = 0u64;
        for priority in keys::PRIORITY_MIN..=keys::PRIORITY_MAX {
            let length = self
                .store
                .zset_len(&keys::priority_queue(priority))
                .await?;
            queue_lengths.insert(priority, length);
            total_tasks += length;
        }

        let processed_tasks = self.store.hash_len(keys::RESULTS).await?;
        let failed_tasks = self.store.hash_len(keys::FAILED_TASKS).await?;

        let workers = self.store.hash_all(keys::WORKERS).await?;
        let snapshots = self.store.hash_all(keys::WORKER_METRICS).await?;
        let now = Utc::now();

        let mut worker_metrics = HashMap::new();
        for (worker_id, last_seen_raw) in &workers {
            let last_seen = last_seen_raw
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .unwrap_or(now);

            let tasks_processed = snapshots
                .get(worker_id)
                .and_then(|raw| serde_json::from_str::<MetricsSnapshot>(raw).ok())
                .map(|snapshot| snapshot.tasks_processed)
                .unwrap_or(0);

            let assigned = self
                .store
                .hash_len(&keys::worker_inbox(worker_id))
                .await?;
            let processing = self
                .store
                .hash_len(&keys::worker_processing(worker_id))
                .await?;

            let status = if (now - last_seen).num_seconds() > INACTIVE_AFTER_SECS {
                "inactive"
            } else {
                "active"
            };

            worker_metrics.insert(
                worker_id.clone(),
                WorkerInfo {
                    id: worker_id.clone(),
                    last_seen,
                    tasks_processed,
                    active_tasks: assigned + processing,
                    status: status.to_string(),
                },
            );
        }

        Ok(SystemMetrics {
            active_workers: workers.len(),
            total_tasks,
            processed_tasks,
            failed_tasks,
            queue_lengths,
            worker_metrics,
        })
    }
}
