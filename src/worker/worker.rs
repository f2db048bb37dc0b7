//! Worker Actor
//!
//! A worker registers itself, heartbeats, pulls assigned tasks from its
//! inbox, executes them on an in-process executor pool and writes results
//! to its outbox for the coordinator to reap.
//!
//! ## Loops
//! - **Heartbeat** (10 s): refreshes the liveness registry entry.
//! - **CheckForWork** (100 ms): drains the inbox into the bounded task
//!   channel; poison entries go straight to the failed table.
//! - **Executors** (`pool_size`, adjustable by the autoscaler): block on the
//!   task channel, execute through the handler registry and emit results.
//! - **SubmitResults**: drains the result channel into the outbox, retrying
//!   store errors with backoff.
//!
//! Every loop observes the worker's shutdown signal. On shutdown the worker
//! waits for in-flight executors and drains remaining results before
//! returning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::store::{keys, SharedStore};
use crate::task::{Scheduler, Task, TaskResult, TaskStatus};

use super::autoscaler::AutoScaler;
use super::metrics::{MetricsPublisher, WorkerMetrics};
use super::registry::TaskHandlerRegistry;
use super::stealing::WorkStealer;

/// Bounded handoff depth for the task and result channels. Small enough to
/// surface backpressure to the coordinator, large enough not to starve the
/// pool.
const CHANNEL_CAPACITY: usize = 1000;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const CHECK_FOR_WORK_INTERVAL: Duration = Duration::from_millis(100);
const HANDOFF_TIMEOUT: Duration = Duration::from_millis(100);
const SUBMIT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub enable_steal: bool,
    pub min_workers: usize,
    pub max_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            enable_steal: false,
            min_workers: 1,
            max_workers: 10,
        }
    }
}

pub struct Worker {
    id: String,
    store: Arc<dyn SharedStore>,
    scheduler: Scheduler,
    registry: Arc<TaskHandlerRegistry>,
    config: WorkerConfig,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn SharedStore>,
        registry: Arc<TaskHandlerRegistry>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            scheduler: Scheduler::new(store.clone()),
            store,
            registry,
            config,
            metrics: Arc::new(WorkerMetrics::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        self.metrics.clone()
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            "Starting worker {} with pool size {}",
            self.id,
            self.config.pool_size
        );

        self.register().await?;

        let (tasks_tx, tasks_rx) = mpsc::channel::<Task>(CHANNEL_CAPACITY);
        let (results_tx, results_rx) = mpsc::channel::<TaskResult>(CHANNEL_CAPACITY);
        let tasks_rx = Arc::new(Mutex::new(tasks_rx));

        let pool = Arc::new(ExecutorPool::new(
            self.clone(),
            tasks_rx,
            results_tx,
            shutdown.clone(),
        ));
        for _ in 0..self.config.pool_size {
            pool.spawn_executor().await;
        }

        tokio::spawn(self.clone().heartbeat(shutdown.clone()));
        tokio::spawn(self.clone().check_for_work(tasks_tx, shutdown.clone()));
        let submit = tokio::spawn(self.clone().submit_results(results_rx, shutdown.clone()));

        let publisher =
            MetricsPublisher::new(self.id.clone(), self.store.clone(), self.metrics.clone());
        tokio::spawn(publisher.run(shutdown.clone()));

        if self.config.enable_steal {
            let stealer =
                WorkStealer::new(self.id.clone(), self.store.clone(), self.metrics.clone());
            tokio::spawn(stealer.run(shutdown.clone()));
        }

        let autoscaler = AutoScaler::new(
            self.config.min_workers,
            self.config.max_workers,
            self.metrics.clone(),
        );
        tokio::spawn(autoscaler.run(pool.clone(), shutdown.clone()));

        let mut shutdown_wait = shutdown.clone();
        while !*shutdown_wait.borrow() {
            if shutdown_wait.changed().await.is_err() {
                break;
            }
        }

        tracing::info!("Worker {} shutting down, waiting for executors", self.id);
        pool.join_all().await;
        drop(pool);
        // The submit loop ends once every result sender is gone and the
        // channel is drained, so no finished work is left behind.
        let _ = submit.await;

        tracing::info!("Worker {} stopped", self.id);
        Ok(())
    }

    /// Registers in the liveness table and clears remnants of a previous
    /// instance with the same id.
    async fn register(&self) -> Result<()> {
        self.store
            .register_worker(&self.id, Utc::now().timestamp())
            .await
            .context("failed to register worker")?;

        tracing::info!("Worker {} registered", self.id);
        Ok(())
    }

    async fn heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    let now = Utc::now().timestamp().to_string();
                    if let Err(e) = self.store.hash_set(keys::WORKERS, &self.id, &now).await {
                        tracing::warn!("Failed to send heartbeat: {}", e);
                    }
                }
            }
        }
    }

    async fn check_for_work(
        self: Arc<Self>,
        tasks_tx: mpsc::Sender<Task>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(CHECK_FOR_WORK_INTERVAL);
        let inbox_key = keys::worker_inbox(&self.id);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    let entries = match self.store.hash_all(&inbox_key).await {
                        Ok(entries) => entries,
                        Err(e) => {
                            tracing::warn!("Failed to fetch inbox: {}", e);
                            continue;
                        }
                    };

                    self.metrics
                        .queue_length
                        .store(entries.len() as i64, Ordering::Relaxed);

                    if !entries.is_empty() {
                        tracing::debug!("Found {} task(s) in inbox", entries.len());
                    }

                    let now = Utc::now();
                    for (task_id, raw) in entries {
                        let task: Task = match serde_json::from_str(&raw) {
                            Ok(task) => task,
                            Err(e) => {
                                // Poison pill: quarantine without retry.
                                tracing::warn!("Failed to decode task {}: {}", task_id, e);
                                if let Err(e) =
                                    self.store.hash_set(keys::FAILED_TASKS, &task_id, &raw).await
                                {
                                    tracing::warn!("Failed to quarantine task {}: {}", task_id, e);
                                    continue;
                                }
                                let _ = self.store.hash_del(&inbox_key, &task_id).await;
                                continue;
                            }
                        };

                        if !task.is_eligible(now) {
                            // Backoff has not elapsed; leave it visible in the inbox.
                            continue;
                        }

                        match timeout(HANDOFF_TIMEOUT, tasks_tx.send(task)).await {
                            Ok(Ok(())) => {
                                if let Err(e) = self.store.hash_del(&inbox_key, &task_id).await {
                                    tracing::warn!(
                                        "Failed to clear inbox entry {}: {}",
                                        task_id,
                                        e
                                    );
                                }
                            }
                            Ok(Err(_)) => return,
                            Err(_) => {
                                tracing::trace!(
                                    "Executors busy, task {} stays in inbox",
                                    task_id
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    async fn executor_loop(
        self: Arc<Self>,
        executor_id: usize,
        tasks_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
        results_tx: mpsc::Sender<TaskResult>,
        mut shutdown: watch::Receiver<bool>,
        mut retire: watch::Receiver<bool>,
    ) {
        tracing::info!("Executor {} started", executor_id);

        loop {
            if *shutdown.borrow() || *retire.borrow() {
                break;
            }

            let received: Option<Option<Task>> = {
                let mut guard = tasks_rx.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => None,
                    _ = retire.changed() => None,
                    task = guard.recv() => Some(task),
                }
            };

            match received {
                None => continue,
                Some(None) => break,
                Some(Some(task)) => {
                    self.metrics.idle_executors.fetch_sub(1, Ordering::Relaxed);
                    if let Err(e) = self.process_task(task, &results_tx).await {
                        tracing::error!(
                            "Executor {} failed to record task outcome: {}",
                            executor_id,
                            e
                        );
                    }
                    self.metrics.idle_executors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.metrics.active_executors.fetch_sub(1, Ordering::Relaxed);
        self.metrics.idle_executors.fetch_sub(1, Ordering::Relaxed);
        tracing::info!("Executor {} stopped", executor_id);
    }

    async fn process_task(
        &self,
        mut task: Task,
        results_tx: &mpsc::Sender<TaskResult>,
    ) -> Result<()> {
        if !task.is_eligible(Utc::now()) {
            // Pulled before its backoff elapsed; put it back where the next
            // inbox scan or a stealer can see it.
            let encoded = serde_json::to_string(&task)?;
            self.store
                .hash_set(&keys::worker_inbox(&self.id), &task.id, &encoded)
                .await?;
            return Ok(());
        }

        tracing::debug!("Processing task {}", task.id);
        let start_time = Utc::now();

        task.status = TaskStatus::Processing;
        task.worker_id = Some(self.id.clone());
        task.touch();

        let processing_key = keys::worker_processing(&self.id);
        let encoded = serde_json::to_string(&task)?;
        self.store
            .hash_set(&processing_key, &task.id, &encoded)
            .await?;

        let outcome = self.registry.execute(&task).await;
        let end_time = Utc::now();

        self.store.hash_del(&processing_key, &task.id).await?;

        match outcome {
            Ok(output) => {
                self.metrics.tasks_processed.fetch_add(1, Ordering::Relaxed);
                let result = TaskResult {
                    task_id: task.id.clone(),
                    status: TaskStatus::Completed,
                    output: if output.is_empty() { None } else { Some(output) },
                    error: None,
                    start_time,
                    end_time,
                    retry_count: task.retry_count,
                    worker_id: self.id.clone(),
                    metrics: None,
                };
                // Block on the bounded channel rather than drop: the submit
                // loop is the only consumer and always drains.
                results_tx
                    .send(result)
                    .await
                    .map_err(|_| anyhow!("results channel closed"))?;
                tracing::debug!("Task {} completed", task.id);
            }
            Err(e) => {
                tracing::warn!("Task {} failed: {}", task.id, e);
                if task.retry_count < task.max_retries {
                    task.status = TaskStatus::Retrying;
                    self.scheduler.retry(&mut task).await?;
                } else {
                    let result = TaskResult {
                        task_id: task.id.clone(),
                        status: TaskStatus::Failed,
                        output: None,
                        error: Some(e.to_string()),
                        start_time,
                        end_time,
                        retry_count: task.retry_count,
                        worker_id: self.id.clone(),
                        metrics: None,
                    };
                    results_tx
                        .send(result)
                        .await
                        .map_err(|_| anyhow!("results channel closed"))?;
                }
            }
        }

        Ok(())
    }

    async fn submit_results(
        self: Arc<Self>,
        mut results_rx: mpsc::Receiver<TaskResult>,
        shutdown: watch::Receiver<bool>,
    ) {
        let outbox_key = keys::worker_outbox(&self.id);

        while let Some(result) = results_rx.recv().await {
            let encoded = match serde_json::to_string(&result) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::error!("Failed to encode result for task {}: {}", result.task_id, e);
                    continue;
                }
            };

            loop {
                match self
                    .store
                    .hash_set(&outbox_key, &result.task_id, &encoded)
                    .await
                {
                    Ok(()) => {
                        tracing::debug!("Submitted result for task {}", result.task_id);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to store result for task {}: {}",
                            result.task_id,
                            e
                        );
                        if *shutdown.borrow() {
                            tracing::error!(
                                "Dropping result for task {} during shutdown",
                                result.task_id
                            );
                            break;
                        }
                        let jitter = rand::random::<u64>() % 100;
                        tokio::time::sleep(SUBMIT_RETRY_DELAY + Duration::from_millis(jitter))
                            .await;
                    }
                }
            }
        }
    }
}

/// The worker's executor pool. Executors share one receiving end of the task
/// channel; the autoscaler grows and shrinks the pool through this handle.
pub struct ExecutorPool {
    worker: Arc<Worker>,
    tasks_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    results_tx: mpsc::Sender<TaskResult>,
    shutdown: watch::Receiver<bool>,
    executors: Mutex<Vec<ExecutorHandle>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
}

struct ExecutorHandle {
    id: usize,
    retire_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ExecutorPool {
    pub(crate) fn new(
        worker: Arc<Worker>,
        tasks_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
        results_tx: mpsc::Sender<TaskResult>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            worker,
            tasks_rx,
            results_tx,
            shutdown,
            executors: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    pub async fn spawn_executor(&self) {
        let executor_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (retire_tx, retire_rx) = watch::channel(false);

        self.worker
            .metrics
            .active_executors
            .fetch_add(1, Ordering::Relaxed);
        self.worker
            .metrics
            .idle_executors
            .fetch_add(1, Ordering::Relaxed);

        let join = tokio::spawn(self.worker.clone().executor_loop(
            executor_id,
            self.tasks_rx.clone(),
            self.results_tx.clone(),
            self.shutdown.clone(),
            retire_rx,
        ));

        self.executors.lock().await.push(ExecutorHandle {
            id: executor_id,
            retire_tx,
            join,
        });
    }

    /// Signals the most recently spawned executor to exit after its current
    /// task. Returns `false` when the pool is already empty.
    pub async fn retire_one(&self) -> bool {
        let Some(handle) = self.executors.lock().await.pop() else {
            return false;
        };

        let _ = handle.retire_tx.send(true);
        tracing::info!("Signalled executor {} to retire", handle.id);
        self.retired.lock().await.push(handle.join);
        true
    }

    pub async fn executor_count(&self) -> usize {
        self.executors.lock().await.len()
    }

    /// Waits for every executor, including retired ones still finishing
    /// their last task.
    pub async fn join_all(&self) {
        let handles: Vec<ExecutorHandle> = self.executors.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.join.await;
        }
        let retired: Vec<JoinHandle<()>> = self.retired.lock().await.drain(..).collect();
        for join in retired {
            let _ = join.await;
        }
    }
}
