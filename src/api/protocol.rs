use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Endpoints
pub const ENDPOINT_WORKERS: &str = "/api/workers";
pub const ENDPOINT_WORKERS_START: &str = "/api/workers/start";
pub const ENDPOINT_WORKERS_STOP: &str = "/api/workers/stop";
pub const ENDPOINT_TASKS_SUBMIT: &str = "/api/tasks/submit";
pub const ENDPOINT_TASKS_STATUS: &str = "/api/tasks/status";
pub const ENDPOINT_METRICS: &str = "/api/metrics";
pub const ENDPOINT_SYSTEM_RESET: &str = "/api/system/reset";
pub const ENDPOINT_DEBUG: &str = "/api/debug";

fn default_pool_size() -> usize {
    5
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkerRequest {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub enable_steal: bool,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkerResponse {
    pub status: String,
    pub id: String,
    pub config: StartWorkerRequest,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopWorkerResponse {
    pub status: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskRequest {
    pub priority: u8,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub retries: u32,
    pub task_type: String,
    pub payload: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskResponse {
    pub task_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Aggregate view over the whole platform, rebuilt once per second by the
/// metrics collector.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub active_workers: usize,
    pub total_tasks: u64,
    pub processed_tasks: u64,
    pub failed_tasks: u64,
    pub queue_lengths: HashMap<u8, u64>,
    pub worker_metrics: HashMap<String, WorkerInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: String,
    pub last_seen: DateTime<Utc>,
    pub tasks_processed: u64,
    pub active_tasks: u64,
    pub status: String,
}
