//! HTTP Request Handlers
//!
//! Axum route handlers for the control plane. These are the only paths by
//! which external clients touch the core: enqueue onto the priority queues,
//! read-only queries over the shared store, and the worker start/stop
//! control path.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;

use crate::store::{keys, purge_all};
use crate::task::{ScheduleOptions, Task, TaskResult};
use crate::worker::{Worker, WorkerConfig};

use super::protocol::*;
use super::server::ApiState;

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn internal_error(message: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Starts a new worker inside this process and tracks its shutdown handle
/// so it can be stopped again through the API.
pub async fn handle_start_worker(
    Extension(state): Extension<Arc<ApiState>>,
    body: Result<Json<StartWorkerRequest>, JsonRejection>,
) -> Response {
    // Any decode failure is the caller's fault, not a 422.
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(format!("Invalid request: {}", rejection)),
    };

    if req.pool_size == 0 {
        return bad_request("poolSize must be at least 1");
    }
    if req.min_workers == 0 || req.min_workers > req.max_workers {
        return bad_request("minWorkers must be at least 1 and not exceed maxWorkers");
    }

    let config = WorkerConfig {
        pool_size: req.pool_size,
        enable_steal: req.enable_steal,
        min_workers: req.min_workers,
        max_workers: req.max_workers,
    };

    let worker = Worker::new(state.store.clone(), state.registry.clone(), config);
    let worker_id = worker.id().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    state.local_workers.insert(worker_id.clone(), shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = worker.run(shutdown_rx).await {
            tracing::error!("Worker failed: {}", e);
        }
    });

    tracing::info!("Started worker {} via API", worker_id);

    (
        StatusCode::CREATED,
        Json(StartWorkerResponse {
            status: "Worker started".to_string(),
            id: worker_id,
            config: req,
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct StopWorkerParams {
    id: Option<String>,
}

/// Stops a worker: signals the in-process instance when it was started
/// here, then clears its registration and buckets from the store.
pub async fn handle_stop_worker(
    Extension(state): Extension<Arc<ApiState>>,
    Query(params): Query<StopWorkerParams>,
) -> Response {
    let Some(worker_id) = params.id else {
        return bad_request("Worker ID required");
    };

    if let Some((_, shutdown_tx)) = state.local_workers.remove(&worker_id) {
        let _ = shutdown_tx.send(true);
        tracing::info!("Signalled worker {} to shut down", worker_id);
    }

    if let Err(e) = state.store.hash_del(keys::WORKERS, &worker_id).await {
        return internal_error(format!("Failed to deregister worker: {}", e));
    }
    let buckets = vec![
        keys::worker_inbox(&worker_id),
        keys::worker_processing(&worker_id),
        keys::worker_outbox(&worker_id),
    ];
    if let Err(e) = state.store.delete(&buckets).await {
        return internal_error(format!("Failed to clean worker state: {}", e));
    }

    Json(StopWorkerResponse {
        status: "Worker stopped".to_string(),
        id: worker_id,
    })
    .into_response()
}

pub async fn handle_submit_task(
    Extension(state): Extension<Arc<ApiState>>,
    body: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(format!("Invalid request: {}", rejection)),
    };

    if !(1..=10).contains(&req.priority) {
        return bad_request("priority must be between 1 and 10");
    }

    let deadline = match &req.deadline {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(deadline) => Some(deadline.with_timezone(&Utc)),
            Err(_) => return bad_request("Invalid deadline format"),
        },
        None => None,
    };

    let mut task = Task::new(&req.task_type, req.payload.clone().into_bytes());
    let opts = ScheduleOptions {
        priority: req.priority,
        deadline,
        max_retries: req.retries,
        dependencies: Vec::new(),
    };

    if let Err(e) = state.scheduler.schedule(&mut task, &opts).await {
        tracing::error!("Failed to queue task: {}", e);
        return internal_error("Failed to queue task");
    }

    tracing::info!("Task {} submitted with priority {}", task.id, task.priority);

    (
        StatusCode::CREATED,
        Json(SubmitTaskResponse {
            task_id: task.id,
            status: "queued".to_string(),
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct TaskStatusParams {
    id: Option<String>,
}

/// Looks a task up in the terminal tables. Tasks still moving through the
/// pipeline are not visible here until they are reaped.
pub async fn handle_task_status(
    Extension(state): Extension<Arc<ApiState>>,
    Query(params): Query<TaskStatusParams>,
) -> Response {
    let Some(task_id) = params.id else {
        return bad_request("Task ID required");
    };

    for table in [keys::RESULTS, keys::FAILED_TASKS] {
        match state.store.hash_get(table, &task_id).await {
            Ok(Some(raw)) => match serde_json::from_str::<TaskResult>(&raw) {
                Ok(result) => return Json(result).into_response(),
                Err(e) => {
                    return internal_error(format!("Unreadable result: {}", e));
                }
            },
            Ok(None) => {}
            Err(e) => return internal_error(format!("Store error: {}", e)),
        }
    }

    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "Task not found".to_string(),
        }),
    )
        .into_response()
}

pub async fn handle_metrics(Extension(state): Extension<Arc<ApiState>>) -> Response {
    match state.metrics.read().await.clone() {
        Some(metrics) => Json(metrics).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "No metrics available".to_string(),
            }),
        )
            .into_response(),
    }
}

pub async fn handle_workers(Extension(state): Extension<Arc<ApiState>>) -> Response {
    match state.metrics.read().await.clone() {
        Some(metrics) => Json(metrics.worker_metrics).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "No metrics available".to_string(),
            }),
        )
            .into_response(),
    }
}

pub async fn handle_reset(Extension(state): Extension<Arc<ApiState>>) -> Response {
    match purge_all(&state.store).await {
        Ok(()) => Json(ResetResponse {
            status: "System reset successful".to_string(),
        })
        .into_response(),
        Err(e) => internal_error(format!("Failed to reset system: {}", e)),
    }
}

/// Raw dump of every queue, bucket and table for operators.
pub async fn handle_debug(Extension(state): Extension<Arc<ApiState>>) -> Response {
    let mut debug = serde_json::Map::new();

    for priority in keys::PRIORITY_MIN..=keys::PRIORITY_MAX {
        if let Ok(tasks) = state
            .store
            .zset_range(&keys::priority_queue(priority), 1000)
            .await
        {
            debug.insert(format!("queue_{}", priority), serde_json::json!(tasks));
        }
    }

    let workers = state.store.hash_all(keys::WORKERS).await.unwrap_or_default();
    let mut worker_states = serde_json::Map::new();
    for worker_id in workers.keys() {
        let assigned = state
            .store
            .hash_all(&keys::worker_inbox(worker_id))
            .await
            .unwrap_or_default();
        let processing = state
            .store
            .hash_all(&keys::worker_processing(worker_id))
            .await
            .unwrap_or_default();
        let completed = state
            .store
            .hash_all(&keys::worker_outbox(worker_id))
            .await
            .unwrap_or_default();
        worker_states.insert(
            worker_id.clone(),
            serde_json::json!({
                "assigned_tasks": assigned,
                "processing_tasks": processing,
                "completed_tasks": completed,
            }),
        );
    }
    debug.insert("workers".to_string(), serde_json::Value::Object(worker_states));

    let results = state.store.hash_all(keys::RESULTS).await.unwrap_or_default();
    debug.insert("results".to_string(), serde_json::json!(results));

    let failed = state
        .store
        .hash_all(keys::FAILED_TASKS)
        .await
        .unwrap_or_default();
    debug.insert("failed_tasks".to_string(), serde_json::json!(failed));

    Json(serde_json::Value::Object(debug)).into_response()
}
