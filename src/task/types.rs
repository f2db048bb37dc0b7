use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Retrying,
}

/// A unit of work. Serialized as JSON wherever it lives in the shared store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Vec<u8>,
    pub status: TaskStatus,
    pub priority: u8,
    pub complexity_score: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Earliest time this task may execute again. `None` means immediately.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl Task {
    pub fn new(task_type: &str, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.to_string(),
            payload,
            status: TaskStatus::Pending,
            priority: 1,
            complexity_score: 1,
            dependencies: Vec::new(),
            retry_count: 0,
            max_retries: 0,
            deadline: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            worker_id: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the task may execute at `now`, honoring retry backoff.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.next_retry_at {
            Some(at) => at <= now,
            None => true,
        }
    }
}

/// The outcome of executing a task, produced by a worker and reaped by the
/// coordinator into the global result tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

/// Scheduling parameters supplied at submission time.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub priority: u8,
    pub deadline: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub dependencies: Vec<String>,
}
