//! Coordinator Actor
//!
//! Owns the dispatch side of the platform with three concurrent loops:
//!
//! 1. **Distribute** (100 ms): pulls batches from the priority queues,
//!    highest priority first, and assigns tasks to live workers round-robin
//!    via a create-if-absent write into the worker's inbox.
//! 2. **Reap** (100 ms): drains every live worker's outbox into the global
//!    result tables and wakes dependent tasks.
//! 3. **Monitor** (5 s): tracks heartbeats, declares workers dead past the
//!    liveness gate and salvages their assigned and in-flight tasks back
//!    onto the priority queues.
//!
//! On start the coordinator either wipes the store to a known state
//! (`clean_start`, the single-coordinator default) or, for durable
//! deployments, completes any salvage a previous coordinator left behind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::store::{keys, purge_all, SharedStore};
use crate::task::{Scheduler, Task, TaskResult, TaskStatus};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Wipe queues, registries and result tables on start. Disable when
    /// results must survive coordinator restarts.
    pub clean_start: bool,
    /// Heartbeat age past which a worker is declared dead.
    pub liveness_timeout: Duration,
    /// Tasks pulled from each priority queue per distribute tick.
    pub batch_size: usize,
    pub distribute_interval: Duration,
    pub reap_interval: Duration,
    pub monitor_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            clean_start: true,
            liveness_timeout: Duration::from_secs(30),
            batch_size: 5,
            distribute_interval: Duration::from_millis(100),
            reap_interval: Duration::from_millis(100),
            monitor_interval: Duration::from_secs(5),
        }
    }
}

pub struct Coordinator {
    store: Arc<dyn SharedStore>,
    scheduler: Scheduler,
    config: CoordinatorConfig,
    /// In-process view of live workers (id -> last heartbeat, unix seconds).
    /// Only the monitor loop writes; the other loops read.
    live_workers: DashMap<String, i64>,
    round_robin: AtomicUsize,
}

impl Coordinator {
    pub fn new(store: Arc<dyn SharedStore>, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            scheduler: Scheduler::new(store.clone()),
            store,
            config,
            live_workers: DashMap::new(),
            round_robin: AtomicUsize::new(0),
        })
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.config.clean_start {
            self.cleanup().await?;
        } else {
            self.salvage_orphans().await?;
        }

        tokio::spawn(self.clone().distribute_loop(shutdown.clone()));
        tokio::spawn(self.clone().reap_loop(shutdown.clone()));
        tokio::spawn(self.clone().monitor_loop(shutdown.clone()));

        tracing::info!("Coordinator started");

        let mut shutdown = shutdown;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        tracing::info!("Coordinator stopped");
        Ok(())
    }

    /// Clean-start pass: returns the store to a known-empty state.
    async fn cleanup(&self) -> Result<()> {
        purge_all(&self.store).await?;
        tracing::info!("System state cleaned up");
        Ok(())
    }

    /// Durable-start pass: finishes the salvage of any per-worker bucket
    /// whose worker is no longer registered, so tasks survive a coordinator
    /// crash in the middle of a salvage.
    async fn salvage_orphans(&self) -> Result<()> {
        let registered = self.store.hash_all(keys::WORKERS).await?;

        let mut orphans = Vec::new();
        for pattern in [keys::INBOX_PATTERN, keys::PROCESSING_PATTERN] {
            for key in self.store.keys_matching(pattern).await? {
                if let Some(worker_id) = keys::bucket_owner(&key) {
                    if !registered.contains_key(worker_id)
                        && !orphans.iter().any(|id: &String| id.as_str() == worker_id)
                    {
                        orphans.push(worker_id.to_string());
                    }
                }
            }
        }

        for worker_id in orphans {
            tracing::warn!("Found orphaned buckets for worker {}, salvaging", worker_id);
            self.salvage_worker(&worker_id).await;
        }

        Ok(())
    }

    async fn distribute_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.distribute_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.distribute_once().await {
                        tracing::warn!("Distribute pass failed: {}", e);
                    }
                }
            }
        }
    }

    /// One distribution pass: batches from the highest priority down,
    /// assigned round-robin over the live worker set.
    async fn distribute_once(&self) -> Result<()> {
        let live: Vec<String> = self
            .live_workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        if live.is_empty() {
            return Ok(());
        }

        for priority in (keys::PRIORITY_MIN..=keys::PRIORITY_MAX).rev() {
            let queue_key = keys::priority_queue(priority);
            let batch = self.store.zset_range(&queue_key, self.config.batch_size).await?;
            if batch.is_empty() {
                continue;
            }

            tracing::debug!("Found {} task(s) in priority {} queue", batch.len(), priority);

            for raw in batch {
                let mut task: Task = match serde_json::from_str(&raw) {
                    Ok(task) => task,
                    Err(e) => {
                        // Poison pill in the queue: quarantine it so the
                        // head of the queue does not wedge.
                        tracing::error!("Failed to decode queued task: {}", e);
                        self.store.zset_remove(&queue_key, &raw).await?;
                        let quarantine_id = format!("unparsed:{}", Uuid::new_v4());
                        self.store
                            .hash_set(keys::FAILED_TASKS, &quarantine_id, &raw)
                            .await?;
                        continue;
                    }
                };

                let index = self.round_robin.fetch_add(1, Ordering::Relaxed);
                let worker_id = &live[index % live.len()];

                task.status = TaskStatus::Assigned;
                task.worker_id = Some(worker_id.clone());
                task.touch();
                let assigned = serde_json::to_string(&task)?;

                match self
                    .store
                    .hash_set_nx(&keys::worker_inbox(worker_id), &task.id, &assigned)
                    .await
                {
                    Ok(created) => {
                        if created {
                            tracing::debug!("Assigned task {} to worker {}", task.id, worker_id);
                        } else {
                            tracing::debug!(
                                "Task {} already assigned, dropping queue copy",
                                task.id
                            );
                        }
                        // Remove the original member either way; the inbox
                        // uniqueness check is what prevents double placement.
                        self.store.zset_remove(&queue_key, &raw).await?;
                    }
                    Err(e) => {
                        // Store hiccup: the task stays on the queue and the
                        // next tick retries.
                        tracing::warn!("Failed to assign task {}: {}", task.id, e);
                    }
                }
            }
        }

        Ok(())
    }

    async fn reap_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.reap_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    let workers: Vec<String> = self
                        .live_workers
                        .iter()
                        .map(|entry| entry.key().clone())
                        .collect();
                    for worker_id in workers {
                        if let Err(e) = self.reap_worker(&worker_id).await {
                            tracing::warn!("Failed to reap worker {}: {}", worker_id, e);
                        }
                    }
                }
            }
        }
    }

    /// Moves every result in a worker's outbox into the terminal tables and
    /// wakes tasks that were waiting on them.
    async fn reap_worker(&self, worker_id: &str) -> Result<()> {
        let outbox_key = keys::worker_outbox(worker_id);
        let results = self.store.hash_all(&outbox_key).await?;

        for (task_id, raw) in results {
            let table = match serde_json::from_str::<TaskResult>(&raw) {
                Ok(result) if result.status == TaskStatus::Failed => keys::FAILED_TASKS,
                Ok(_) => keys::RESULTS,
                Err(e) => {
                    tracing::warn!("Unreadable result for task {}: {}", task_id, e);
                    keys::FAILED_TASKS
                }
            };

            self.store.hash_set(table, &task_id, &raw).await?;
            self.store.hash_del(&outbox_key, &task_id).await?;
            tracing::debug!("Reaped result for task {} into {}", task_id, table);

            if let Err(e) = self.scheduler.on_task_complete(&task_id).await {
                tracing::warn!("Failed to wake dependents of task {}: {}", task_id, e);
            }
        }

        Ok(())
    }

    async fn monitor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.monitor_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.monitor_once().await {
                        tracing::warn!("Monitor pass failed: {}", e);
                    }
                }
            }
        }
    }

    /// One liveness pass: refreshes the in-process live set and salvages
    /// workers whose heartbeat lapsed past the liveness gate.
    async fn monitor_once(&self) -> Result<()> {
        let workers = self.store.hash_all(keys::WORKERS).await?;
        let now = Utc::now().timestamp();
        let gate = self.config.liveness_timeout.as_secs() as i64;

        for (worker_id, last_seen_raw) in &workers {
            let last_seen: i64 = match last_seen_raw.parse() {
                Ok(ts) => ts,
                Err(_) => {
                    tracing::warn!("Dropping worker {} with bad heartbeat", worker_id);
                    self.store.hash_del(keys::WORKERS, worker_id).await?;
                    self.live_workers.remove(worker_id);
                    continue;
                }
            };

            if now - last_seen <= gate {
                self.live_workers.insert(worker_id.clone(), last_seen);
            } else {
                tracing::warn!(
                    "Worker {} missed liveness gate ({}s), salvaging its tasks",
                    worker_id,
                    now - last_seen
                );
                self.live_workers.remove(worker_id);
                self.store.hash_del(keys::WORKERS, worker_id).await?;
                self.salvage_worker(worker_id).await;
            }
        }

        // Forget workers deregistered out of band (e.g. stopped via the
        // control plane) so distribution stops targeting them.
        self.live_workers
            .retain(|worker_id, _| workers.contains_key(worker_id));

        Ok(())
    }

    /// Recovers everything a dead worker owned: unreaped results go to the
    /// terminal tables, assigned and in-flight tasks go back onto their
    /// priority queues with fresh scores, then the buckets are deleted.
    /// Every step is idempotent, so a crash mid-salvage is completed by the
    /// next coordinator start.
    async fn salvage_worker(&self, worker_id: &str) {
        if let Err(e) = self.reap_worker(worker_id).await {
            tracing::warn!("Failed to reap outbox of dead worker {}: {}", worker_id, e);
        }

        for bucket in [
            keys::worker_inbox(worker_id),
            keys::worker_processing(worker_id),
        ] {
            let entries = match self.store.hash_all(&bucket).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("Failed to read {} for salvage: {}", bucket, e);
                    continue;
                }
            };

            for (task_id, raw) in entries {
                match serde_json::from_str::<Task>(&raw) {
                    Ok(mut task) => {
                        task.status = TaskStatus::Pending;
                        task.worker_id = None;
                        task.touch();
                        if let Err(e) = self.scheduler.enqueue(&task).await {
                            // Leave the bucket in place; a later salvage
                            // pass picks the task up again.
                            tracing::error!("Failed to requeue task {}: {}", task.id, e);
                            return;
                        }
                        tracing::info!(
                            "Salvaged task {} from dead worker {}",
                            task.id,
                            worker_id
                        );
                    }
                    Err(e) => {
                        tracing::warn!("Unreadable task {} in {}: {}", task_id, bucket, e);
                        if let Err(e) =
                            self.store.hash_set(keys::FAILED_TASKS, &task_id, &raw).await
                        {
                            tracing::error!("Failed to quarantine task {}: {}", task_id, e);
                            return;
                        }
                    }
                }
            }
        }

        let buckets = vec![
            keys::worker_inbox(worker_id),
            keys::worker_processing(worker_id),
            keys::worker_outbox(worker_id),
        ];
        if let Err(e) = self.store.delete(&buckets).await {
            tracing::warn!("Failed to delete buckets of worker {}: {}", worker_id, e);
        }
    }

    #[cfg(test)]
    pub(crate) fn mark_live(&self, worker_id: &str) {
        self.live_workers
            .insert(worker_id.to_string(), Utc::now().timestamp());
    }

    #[cfg(test)]
    pub(crate) fn is_live(&self, worker_id: &str) -> bool {
        self.live_workers.contains_key(worker_id)
    }

    #[cfg(test)]
    pub(crate) async fn distribute_pass(&self) -> Result<()> {
        self.distribute_once().await
    }

    #[cfg(test)]
    pub(crate) async fn reap_pass(&self, worker_id: &str) -> Result<()> {
        self.reap_worker(worker_id).await
    }

    #[cfg(test)]
    pub(crate) async fn monitor_pass(&self) -> Result<()> {
        self.monitor_once().await
    }

    #[cfg(test)]
    pub(crate) async fn startup_pass(&self) -> Result<()> {
        if self.config.clean_start {
            self.cleanup().await
        } else {
            self.salvage_orphans().await
        }
    }
}
