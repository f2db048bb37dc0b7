use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;

use crate::task::Task;

pub type TaskHandlerFn =
    Arc<dyn Fn(Task) -> Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>> + Send + Sync>;

/// Maps task type tags to executable handlers.
///
/// This is the extension point for real workloads: register a handler for a
/// task type and every worker holding this registry will run it. Types
/// without a handler fall back to the built-in simulation, which sleeps for
/// `complexity_score` seconds and produces empty output.
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, TaskHandlerFn>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    pub fn register<F, Fut>(&self, task_type: &str, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        let handler_fn: TaskHandlerFn = Arc::new(move |task: Task| {
            Box::pin(handler(task)) as Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>>
        });

        self.handlers.insert(task_type.to_string(), handler_fn);

        tracing::info!("Registered task handler: {}", task_type);
    }

    pub async fn execute(&self, task: &Task) -> Result<Vec<u8>> {
        let handler_fn = self.handlers.get(&task.task_type).map(|e| e.value().clone());

        match handler_fn {
            Some(handler_fn) => {
                tracing::debug!(
                    "Executing task {} with handler '{}' (payload: {} bytes)",
                    task.id,
                    task.task_type,
                    task.payload.len()
                );
                handler_fn(task.clone()).await
            }
            None => {
                tracing::debug!(
                    "No handler for task type '{}', simulating {} second(s) of work",
                    task.task_type,
                    task.complexity_score
                );
                tokio::time::sleep(Duration::from_secs(task.complexity_score as u64)).await;
                Ok(Vec::new())
            }
        }
    }

    pub fn has_handler(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
