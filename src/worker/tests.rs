//! Worker Module Tests
//!
//! Covers the handler registry, the worker's end-to-end pull/execute/submit
//! flow against the in-memory store, retry handling, work stealing, and the
//! autoscaler's scaling decisions.

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::{mpsc, watch, Mutex};
    use tokio::time::sleep;

    use crate::store::{keys, MemoryStore, SharedStore};
    use crate::task::{Task, TaskResult, TaskStatus};
    use crate::worker::autoscaler::AutoScaler;
    use crate::worker::registry::TaskHandlerRegistry;
    use crate::worker::stealing::WorkStealer;
    use crate::worker::worker::{ExecutorPool, Worker, WorkerConfig};
    use crate::worker::WorkerMetrics;

    fn store() -> Arc<dyn SharedStore> {
        Arc::new(MemoryStore::new())
    }

    fn assigned_task(task_type: &str, worker_id: &str) -> Task {
        let mut task = Task::new(task_type, b"payload".to_vec());
        task.status = TaskStatus::Assigned;
        task.worker_id = Some(worker_id.to_string());
        task
    }

    async fn put_in_inbox(store: &Arc<dyn SharedStore>, worker_id: &str, task: &Task) {
        store
            .hash_set(
                &keys::worker_inbox(worker_id),
                &task.id,
                &serde_json::to_string(task).unwrap(),
            )
            .await
            .unwrap();
    }

    async fn wait_until_registered(store: &Arc<dyn SharedStore>, worker_id: &str) {
        for _ in 0..50 {
            if store.hash_exists(keys::WORKERS, worker_id).await.unwrap() {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("worker {} never registered", worker_id);
    }

    // ============================================================
    // TEST 1: TaskHandlerRegistry
    // ============================================================

    #[tokio::test]
    async fn test_registry_register_and_execute() {
        let registry = TaskHandlerRegistry::new();

        registry.register("echo", |task: Task| async move { Ok(task.payload) });

        assert!(registry.has_handler("echo"));
        assert_eq!(registry.handler_count(), 1);

        let task = Task::new("echo", b"hello".to_vec());
        let output = registry.execute(&task).await.unwrap();
        assert_eq!(output, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_registry_handler_can_fail() {
        let registry = TaskHandlerRegistry::new();

        registry.register("failing", |_task: Task| async {
            Err(anyhow::anyhow!("intentional error"))
        });

        let task = Task::new("failing", Vec::new());
        let err = registry.execute(&task).await.unwrap_err();
        assert!(err.to_string().contains("intentional error"));
    }

    #[tokio::test]
    async fn test_registry_falls_back_to_simulation() {
        let registry = TaskHandlerRegistry::new();

        let mut task = Task::new("unregistered", Vec::new());
        task.complexity_score = 0;

        let output = registry.execute(&task).await.unwrap();
        assert!(output.is_empty());
    }

    // ============================================================
    // TEST 2: End-to-end pull / execute / submit
    // ============================================================

    #[tokio::test]
    async fn test_worker_executes_assigned_task() {
        let store = store();
        let registry = TaskHandlerRegistry::new();
        registry.register("echo", |task: Task| async move { Ok(task.payload) });

        let worker = Worker::new(
            store.clone(),
            registry,
            WorkerConfig {
                pool_size: 1,
                ..WorkerConfig::default()
            },
        );
        let worker_id = worker.id().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.clone().run(shutdown_rx));

        wait_until_registered(&store, &worker_id).await;

        let task = assigned_task("echo", &worker_id);
        put_in_inbox(&store, &worker_id, &task).await;

        // Wait for the result to land in the outbox.
        let outbox_key = keys::worker_outbox(&worker_id);
        for _ in 0..50 {
            if let Some(raw) = store.hash_get(&outbox_key, &task.id).await.unwrap() {
                let result: TaskResult = serde_json::from_str(&raw).unwrap();
                assert_eq!(result.status, TaskStatus::Completed);
                assert_eq!(result.output, Some(b"payload".to_vec()));
                assert_eq!(result.worker_id, worker_id);
                assert!(result.end_time >= result.start_time);

                // The task moved out of inbox and processing.
                assert_eq!(
                    store.hash_len(&keys::worker_inbox(&worker_id)).await.unwrap(),
                    0
                );
                assert_eq!(
                    store
                        .hash_len(&keys::worker_processing(&worker_id))
                        .await
                        .unwrap(),
                    0
                );
                assert_eq!(worker.metrics().tasks_processed.load(Ordering::Relaxed), 1);

                shutdown_tx.send(true).unwrap();
                tokio::time::timeout(Duration::from_secs(5), handle)
                    .await
                    .expect("worker should stop")
                    .unwrap()
                    .unwrap();
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }

        panic!("task was not executed within timeout");
    }

    #[tokio::test]
    async fn test_worker_quarantines_poison_task() {
        let store = store();
        let worker = Worker::new(
            store.clone(),
            TaskHandlerRegistry::new(),
            WorkerConfig {
                pool_size: 1,
                ..WorkerConfig::default()
            },
        );
        let worker_id = worker.id().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        wait_until_registered(&store, &worker_id).await;

        store
            .hash_set(&keys::worker_inbox(&worker_id), "poison-1", "not json")
            .await
            .unwrap();

        for _ in 0..50 {
            if store
                .hash_exists(keys::FAILED_TASKS, "poison-1")
                .await
                .unwrap()
            {
                assert_eq!(
                    store.hash_len(&keys::worker_inbox(&worker_id)).await.unwrap(),
                    0
                );
                shutdown_tx.send(true).unwrap();
                let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }

        panic!("poison task was not quarantined within timeout");
    }

    #[tokio::test]
    async fn test_failed_task_with_budget_is_rescheduled() {
        let store = store();
        let registry = TaskHandlerRegistry::new();
        registry.register("failing", |_task: Task| async {
            Err(anyhow::anyhow!("boom"))
        });

        let worker = Worker::new(
            store.clone(),
            registry,
            WorkerConfig {
                pool_size: 1,
                ..WorkerConfig::default()
            },
        );
        let worker_id = worker.id().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        wait_until_registered(&store, &worker_id).await;

        let mut task = assigned_task("failing", &worker_id);
        task.priority = 5;
        task.max_retries = 1;
        let submitted = Utc::now();
        put_in_inbox(&store, &worker_id, &task).await;

        for _ in 0..50 {
            let members = store
                .zset_range(&keys::priority_queue(5), 10)
                .await
                .unwrap();
            if !members.is_empty() {
                let requeued: Task = serde_json::from_str(&members[0]).unwrap();
                assert_eq!(requeued.id, task.id);
                assert_eq!(requeued.status, TaskStatus::Pending);
                assert_eq!(requeued.retry_count, 1);
                let next = requeued.next_retry_at.expect("backoff must be set");
                assert!(next >= submitted + chrono::Duration::seconds(2));

                // No terminal result yet.
                assert_eq!(
                    store.hash_len(&keys::worker_outbox(&worker_id)).await.unwrap(),
                    0
                );

                shutdown_tx.send(true).unwrap();
                let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }

        panic!("failed task was not rescheduled within timeout");
    }

    #[tokio::test]
    async fn test_exhausted_retries_produce_failed_result() {
        let store = store();
        let registry = TaskHandlerRegistry::new();
        registry.register("failing", |_task: Task| async {
            Err(anyhow::anyhow!("boom"))
        });

        let worker = Worker::new(
            store.clone(),
            registry,
            WorkerConfig {
                pool_size: 1,
                ..WorkerConfig::default()
            },
        );
        let worker_id = worker.id().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        wait_until_registered(&store, &worker_id).await;

        // max_retries zero: the first failure is terminal.
        let task = assigned_task("failing", &worker_id);
        put_in_inbox(&store, &worker_id, &task).await;

        let outbox_key = keys::worker_outbox(&worker_id);
        for _ in 0..50 {
            if let Some(raw) = store.hash_get(&outbox_key, &task.id).await.unwrap() {
                let result: TaskResult = serde_json::from_str(&raw).unwrap();
                assert_eq!(result.status, TaskStatus::Failed);
                assert!(result.error.unwrap().contains("boom"));

                shutdown_tx.send(true).unwrap();
                let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }

        panic!("failed result never reached the outbox");
    }

    #[tokio::test]
    async fn test_ineligible_task_stays_in_inbox() {
        let store = store();
        let worker = Worker::new(
            store.clone(),
            TaskHandlerRegistry::new(),
            WorkerConfig {
                pool_size: 1,
                ..WorkerConfig::default()
            },
        );
        let worker_id = worker.id().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        wait_until_registered(&store, &worker_id).await;

        let mut task = assigned_task("test", &worker_id);
        task.next_retry_at = Some(Utc::now() + chrono::Duration::seconds(60));
        put_in_inbox(&store, &worker_id, &task).await;

        // Give the inbox scan several ticks; the task must not move.
        sleep(Duration::from_millis(500)).await;

        assert!(store
            .hash_exists(&keys::worker_inbox(&worker_id), &task.id)
            .await
            .unwrap());
        assert_eq!(
            store.hash_len(&keys::worker_outbox(&worker_id)).await.unwrap(),
            0
        );
        assert_eq!(
            store
                .hash_len(&keys::worker_processing(&worker_id))
                .await
                .unwrap(),
            0
        );

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    // ============================================================
    // TEST 3: Work stealing
    // ============================================================

    #[tokio::test]
    async fn test_stealer_takes_half_of_busy_sibling_inbox() {
        let store = store();

        store.hash_set(keys::WORKERS, "thief", "1").await.unwrap();
        store.hash_set(keys::WORKERS, "victim", "1").await.unwrap();
        for i in 0..4 {
            store
                .hash_set(
                    &keys::worker_inbox("victim"),
                    &format!("t{}", i),
                    "task-data",
                )
                .await
                .unwrap();
        }

        let metrics = Arc::new(WorkerMetrics::default());
        metrics.idle_executors.store(1, Ordering::Relaxed);
        let stealer = WorkStealer::new("thief".to_string(), store.clone(), metrics);

        stealer.attempt_steal().await.unwrap();

        assert_eq!(
            store.hash_len(&keys::worker_inbox("thief")).await.unwrap(),
            2
        );
        assert_eq!(
            store.hash_len(&keys::worker_inbox("victim")).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_stealer_ignores_shallow_inboxes() {
        let store = store();

        store.hash_set(keys::WORKERS, "thief", "1").await.unwrap();
        store.hash_set(keys::WORKERS, "victim", "1").await.unwrap();
        // Two tasks is at the threshold, not above it.
        for i in 0..2 {
            store
                .hash_set(&keys::worker_inbox("victim"), &format!("t{}", i), "x")
                .await
                .unwrap();
        }

        let metrics = Arc::new(WorkerMetrics::default());
        metrics.idle_executors.store(1, Ordering::Relaxed);
        let stealer = WorkStealer::new("thief".to_string(), store.clone(), metrics);

        stealer.attempt_steal().await.unwrap();

        assert_eq!(
            store.hash_len(&keys::worker_inbox("thief")).await.unwrap(),
            0
        );
        assert_eq!(
            store.hash_len(&keys::worker_inbox("victim")).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_steal_abandons_task_already_present_locally() {
        let store = store();

        // The thief already holds t0 (the coordinator won that race).
        store
            .hash_set(&keys::worker_inbox("thief"), "t0", "mine")
            .await
            .unwrap();
        store
            .hash_set(&keys::worker_inbox("victim"), "t0", "theirs")
            .await
            .unwrap();
        store
            .hash_set(&keys::worker_inbox("victim"), "t1", "x")
            .await
            .unwrap();

        let metrics = Arc::new(WorkerMetrics::default());
        let stealer = WorkStealer::new("thief".to_string(), store.clone(), metrics);

        stealer
            .steal_from("victim", &keys::worker_inbox("victim"))
            .await;

        // The local copy is untouched; the abandoned task was not deleted
        // from the source by the losing create.
        assert_eq!(
            store
                .hash_get(&keys::worker_inbox("thief"), "t0")
                .await
                .unwrap(),
            Some("mine".to_string())
        );
        assert!(store
            .hash_exists(&keys::worker_inbox("victim"), "t0")
            .await
            .unwrap());
    }

    // ============================================================
    // TEST 4: Autoscaler
    // ============================================================

    #[tokio::test]
    async fn test_autoscaler_scales_up_and_down() {
        let store = store();
        let worker = Worker::new(store, TaskHandlerRegistry::new(), WorkerConfig::default());
        let metrics = worker.metrics();

        let (tasks_tx, tasks_rx) = mpsc::channel(10);
        let (results_tx, _results_rx) = mpsc::channel(10);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pool = ExecutorPool::new(
            worker,
            Arc::new(Mutex::new(tasks_rx)),
            results_tx,
            shutdown_rx,
        );
        pool.spawn_executor().await;
        assert_eq!(pool.executor_count().await, 1);

        let autoscaler = AutoScaler::new(1, 3, metrics.clone());

        // Deep backlog: scale up by two, capped by the maximum.
        metrics.queue_length.store(10, Ordering::Relaxed);
        autoscaler.expire_cooldown().await;
        autoscaler.adjust(&pool).await;
        assert_eq!(pool.executor_count().await, 3);

        // Cooldown blocks an immediate follow-up action.
        metrics.queue_length.store(100, Ordering::Relaxed);
        autoscaler.adjust(&pool).await;
        assert_eq!(pool.executor_count().await, 3);

        // Idle pool: scale down one executor at a time, never below the
        // minimum.
        metrics.queue_length.store(0, Ordering::Relaxed);
        autoscaler.expire_cooldown().await;
        autoscaler.adjust(&pool).await;
        assert_eq!(pool.executor_count().await, 2);

        drop(tasks_tx);
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pool.join_all())
            .await
            .expect("executors should stop");
    }

    #[tokio::test]
    async fn test_autoscaler_respects_minimum() {
        let store = store();
        let worker = Worker::new(store, TaskHandlerRegistry::new(), WorkerConfig::default());
        let metrics = worker.metrics();

        let (tasks_tx, tasks_rx) = mpsc::channel(10);
        let (results_tx, _results_rx) = mpsc::channel(10);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pool = ExecutorPool::new(
            worker,
            Arc::new(Mutex::new(tasks_rx)),
            results_tx,
            shutdown_rx,
        );
        for _ in 0..2 {
            pool.spawn_executor().await;
        }

        let autoscaler = AutoScaler::new(2, 4, metrics.clone());
        autoscaler.expire_cooldown().await;
        autoscaler.adjust(&pool).await;

        // active == min_workers, so no retirement happens.
        assert_eq!(pool.executor_count().await, 2);

        drop(tasks_tx);
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pool.join_all())
            .await
            .expect("executors should stop");
    }

    // ============================================================
    // TEST 5: Metrics snapshots
    // ============================================================

    #[test]
    fn test_metrics_snapshot_reflects_counters() {
        let metrics = WorkerMetrics::default();
        metrics.tasks_processed.store(7, Ordering::Relaxed);
        metrics.queue_length.store(3, Ordering::Relaxed);
        metrics.active_executors.store(2, Ordering::Relaxed);
        metrics.idle_executors.store(1, Ordering::Relaxed);

        let snapshot = metrics.snapshot(12.5, 4096);

        assert_eq!(snapshot.tasks_processed, 7);
        assert_eq!(snapshot.queue_length, 3);
        assert_eq!(snapshot.active_workers, 2);
        assert_eq!(snapshot.idle_workers, 1);
        assert_eq!(snapshot.cpu_usage, 12.5);
        assert_eq!(snapshot.memory_usage, 4096);

        // Snapshots round-trip through the store as JSON.
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: crate::worker::MetricsSnapshot = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.tasks_processed, 7);
    }
}
