use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::{Extension, Router};
use dashmap::DashMap;
use tokio::sync::{watch, RwLock};
use tower_http::cors::CorsLayer;

use crate::store::SharedStore;
use crate::task::Scheduler;
use crate::worker::TaskHandlerRegistry;

use super::handlers::*;
use super::metrics::MetricsProbe;
use super::protocol::*;

const METRICS_COLLECT_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state behind every control-plane handler.
pub struct ApiState {
    pub store: Arc<dyn SharedStore>,
    pub scheduler: Scheduler,
    pub registry: Arc<TaskHandlerRegistry>,
    /// Latest aggregate view, rebuilt by the collector loop.
    pub metrics: RwLock<Option<SystemMetrics>>,
    /// Shutdown handles of workers started through this API instance.
    pub local_workers: DashMap<String, watch::Sender<bool>>,
}

impl ApiState {
    pub fn new(store: Arc<dyn SharedStore>, registry: Arc<TaskHandlerRegistry>) -> Arc<Self> {
        Arc::new(Self {
            scheduler: Scheduler::new(store.clone()),
            store,
            registry,
            metrics: RwLock::new(None),
            local_workers: DashMap::new(),
        })
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // System endpoints
        .route(ENDPOINT_METRICS, get(handle_metrics))
        .route(ENDPOINT_DEBUG, get(handle_debug))
        .route(ENDPOINT_SYSTEM_RESET, post(handle_reset))
        // Worker endpoints
        .route(ENDPOINT_WORKERS, get(handle_workers))
        .route(ENDPOINT_WORKERS_START, post(handle_start_worker))
        .route(ENDPOINT_WORKERS_STOP, post(handle_stop_worker))
        // Task endpoints
        .route(ENDPOINT_TASKS_SUBMIT, post(handle_submit_task))
        .route(ENDPOINT_TASKS_STATUS, get(handle_task_status))
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}

/// Serves the control plane until the shutdown signal fires.
pub async fn serve(
    state: Arc<ApiState>,
    addr: &str,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tokio::spawn(collect_metrics(state.clone(), shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind API server to {}", addr))?;
    tracing::info!("API server listening on {}", addr);

    let app = router(state);
    let mut shutdown = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("API server failed")
}

async fn collect_metrics(state: Arc<ApiState>, mut shutdown: watch::Receiver<bool>) {
    let probe = MetricsProbe::new(state.store.clone());
    let mut interval = tokio::time::interval(METRICS_COLLECT_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                match probe.collect().await {
                    Ok(metrics) => {
                        tracing::debug!(
                            "Current state - workers: {}, queued: {}, processed: {}, failed: {}",
                            metrics.active_workers,
                            metrics.total_tasks,
                            metrics.processed_tasks,
                            metrics.failed_tasks
                        );
                        *state.metrics.write().await = Some(metrics);
                    }
                    Err(e) => {
                        tracing::warn!("Metrics collection failed: {}", e);
                    }
                }
            }
        }
    }
}
