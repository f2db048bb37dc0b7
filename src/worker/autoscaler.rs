//! Executor Autoscaling
//!
//! Adjusts the number of live executors inside one worker between
//! `min_workers` and `max_workers`, based on inbox depth and idle count,
//! with a cooldown between scaling actions.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use super::metrics::WorkerMetrics;
use super::worker::ExecutorPool;

const AUTOSCALE_INTERVAL: Duration = Duration::from_secs(10);
const SCALE_COOLDOWN: Duration = Duration::from_secs(30);

/// Executors added per scale-up action.
const SCALE_UP_STEP: i64 = 2;

pub struct AutoScaler {
    min_workers: i64,
    max_workers: i64,
    metrics: Arc<WorkerMetrics>,
    /// No scaling action happens before this instant.
    cooldown_until: Mutex<Instant>,
}

impl AutoScaler {
    pub fn new(min_workers: usize, max_workers: usize, metrics: Arc<WorkerMetrics>) -> Self {
        Self {
            min_workers: min_workers as i64,
            max_workers: max_workers as i64,
            metrics,
            cooldown_until: Mutex::new(Instant::now() + SCALE_COOLDOWN),
        }
    }

    pub async fn run(self, pool: Arc<ExecutorPool>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(AUTOSCALE_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    self.adjust(&pool).await;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn expire_cooldown(&self) {
        *self.cooldown_until.lock().await = Instant::now();
    }

    pub async fn adjust(&self, pool: &ExecutorPool) {
        let mut cooldown_until = self.cooldown_until.lock().await;
        if Instant::now() < *cooldown_until {
            return;
        }

        let queue_length = self.metrics.queue_length.load(Ordering::Relaxed);
        let active = self.metrics.active_executors.load(Ordering::Relaxed);
        let idle = self.metrics.idle_executors.load(Ordering::Relaxed);

        // Scale up when the inbox outruns the pool.
        if queue_length > active * 2 && active < self.max_workers {
            let to_add = (self.max_workers - active).min(SCALE_UP_STEP);
            for _ in 0..to_add {
                pool.spawn_executor().await;
            }
            tracing::info!(
                "Scaled up by {} executor(s) (queue={}, active={})",
                to_add,
                queue_length,
                active
            );
            *cooldown_until = Instant::now() + SCALE_COOLDOWN;
            return;
        }

        // Scale down when more than half the minimum sits idle. Never
        // shrinks below the minimum.
        if idle > self.min_workers / 2 && active > self.min_workers {
            if pool.retire_one().await {
                tracing::info!(
                    "Scaled down one executor (idle={}, active={})",
                    idle,
                    active
                );
                *cooldown_until = Instant::now() + SCALE_COOLDOWN;
            }
        }
    }
}
