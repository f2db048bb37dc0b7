//! Control-Plane HTTP API
//!
//! The admin/ops surface of the platform. External clients interact with
//! the core only through these endpoints: task submission (an enqueue onto
//! the priority queues), read-only status and metrics queries, and the
//! worker start/stop control path. Every endpoint speaks JSON and accepts
//! CORS preflight.
//!
//! ## Submodules
//! - **`protocol`**: request/response contracts, camelCase on the wire.
//! - **`handlers`**: axum route handlers.
//! - **`metrics`**: the read-only system metrics probe.
//! - **`server`**: router assembly, state and the collector loop.

pub mod handlers;
pub mod metrics;
pub mod protocol;
pub mod server;


pub use metrics::MetricsProbe;
pub use protocol::{SystemMetrics, WorkerInfo};
pub use server::{serve, ApiState};
