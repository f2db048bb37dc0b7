//! Task Scheduler
//!
//! Places tasks onto the per-priority ready queues, parks tasks whose
//! dependencies are unresolved, and computes the retry schedule.
//!
//! ## Queue scoring
//! Within a priority queue, lower scores pop first. The score is the
//! submission time in unix seconds minus a deadline bonus: overdue tasks
//! get a 1,000,000 point bonus and preempt everything in their queue,
//! deadline-bearing tasks are boosted by their remaining seconds, and tasks
//! without a deadline order by submission time.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};

use crate::store::{keys, SharedStore};

use super::types::{ScheduleOptions, Task, TaskStatus};

/// Score applied to tasks whose deadline has already passed.
const OVERDUE_BONUS: f64 = 1_000_000.0;

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn SharedStore>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Queue ordering score for `task` as of `now`; earlier scores pop first.
    pub fn score_for(task: &Task, now: DateTime<Utc>) -> f64 {
        let mut score = now.timestamp() as f64;
        if let Some(deadline) = task.deadline {
            let remaining = (deadline - now).num_seconds();
            if remaining < 0 {
                score -= OVERDUE_BONUS;
            } else {
                score -= remaining as f64;
            }
        }
        score
    }

    /// Applies `opts` to the task and either enqueues it or, when it has
    /// unresolved dependencies, parks it in the waiting area.
    pub async fn schedule(&self, task: &mut Task, opts: &ScheduleOptions) -> Result<()> {
        if !(keys::PRIORITY_MIN..=keys::PRIORITY_MAX).contains(&opts.priority) {
            bail!("priority {} out of range 1-10", opts.priority);
        }

        task.priority = opts.priority;
        task.deadline = opts.deadline;
        task.max_retries = opts.max_retries;
        task.dependencies = opts.dependencies.clone();

        if !task.dependencies.is_empty() {
            for dep_id in &task.dependencies {
                if !self.dependency_resolved(dep_id).await? {
                    return self.park(task).await;
                }
            }
        }

        self.enqueue(task).await
    }

    /// Inserts a dependency-free task into its priority queue.
    pub async fn enqueue(&self, task: &Task) -> Result<()> {
        let encoded = serde_json::to_string(task).context("failed to encode task")?;
        let score = Self::score_for(task, Utc::now());
        self.store
            .zset_add(&keys::priority_queue(task.priority), &encoded, score)
            .await
            .with_context(|| format!("failed to queue task {}", task.id))
    }

    /// Parks a task whose dependencies are unmet and indexes it under each
    /// unresolved dependency so completion can wake it.
    async fn park(&self, task: &Task) -> Result<()> {
        let encoded = serde_json::to_string(task).context("failed to encode task")?;
        self.store
            .put(&keys::waiting_task(&task.id), &encoded)
            .await
            .with_context(|| format!("failed to park task {}", task.id))?;

        for dep_id in &task.dependencies {
            self.store
                .set_add(&keys::dependency_waiters(dep_id), &task.id)
                .await
                .with_context(|| format!("failed to track dependency {}", dep_id))?;
        }

        tracing::debug!(
            "Parked task {} on {} dependencies",
            task.id,
            task.dependencies.len()
        );
        Ok(())
    }

    /// A dependency counts as resolved once its id has a terminal entry,
    /// successful or not. Dependents of a failed task run rather than wait
    /// forever; they can inspect the prerequisite's outcome themselves.
    async fn dependency_resolved(&self, task_id: &str) -> Result<bool> {
        if self.store.hash_exists(keys::RESULTS, task_id).await? {
            return Ok(true);
        }
        self.store.hash_exists(keys::FAILED_TASKS, task_id).await
    }

    /// Called after `task_id` reaches a terminal table. Re-checks every task
    /// parked on it and enqueues those whose dependencies are now all
    /// resolved, then drops the reverse index.
    pub async fn on_task_complete(&self, task_id: &str) -> Result<()> {
        let waiters_key = keys::dependency_waiters(task_id);
        let waiter_ids = self.store.set_members(&waiters_key).await?;

        for waiter_id in waiter_ids {
            let waiting_key = keys::waiting_task(&waiter_id);
            let Some(encoded) = self.store.get(&waiting_key).await? else {
                continue;
            };
            let task: Task = match serde_json::from_str(&encoded) {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable waiting task {}: {}", waiter_id, e);
                    continue;
                }
            };

            let mut all_resolved = true;
            for dep_id in &task.dependencies {
                if !self.dependency_resolved(dep_id).await? {
                    all_resolved = false;
                    break;
                }
            }

            if all_resolved {
                self.store.delete(&[waiting_key]).await?;
                self.enqueue(&task).await?;
                tracing::debug!("Dependency gate opened for task {}", task.id);
            }
        }

        self.store.delete(&[waiters_key]).await
    }

    /// Re-schedules a failed task with exponential backoff. Fails when the
    /// retry budget is exhausted.
    pub async fn retry(&self, task: &mut Task) -> Result<()> {
        if task.retry_count >= task.max_retries {
            bail!("max retries exceeded for task {}", task.id);
        }

        task.retry_count += 1;
        task.status = TaskStatus::Pending;
        task.worker_id = None;
        task.next_retry_at = Some(Utc::now() + Duration::seconds(1 << task.retry_count));
        task.touch();

        tracing::debug!(
            "Retrying task {} (attempt {}/{}), eligible at {:?}",
            task.id,
            task.retry_count,
            task.max_retries,
            task.next_retry_at
        );

        self.enqueue(task).await
    }
}
