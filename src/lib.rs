//! Distributed Task Processing Platform Library
//!
//! This library crate defines the core modules of the task-processing
//! platform. It serves as the foundation for the binary executable
//! (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of five loosely coupled subsystems:
//!
//! - **`store`**: The shared state layer. A thin abstraction over the
//!   external key/value store (Redis in production, in-memory in tests)
//!   that holds the queues, per-worker buckets, result tables and the
//!   heartbeat registry.
//! - **`task`**: The task model and the scheduler. Priority/deadline
//!   scoring, dependency gating and the retry schedule.
//! - **`coordinator`**: The dispatch engine. Assigns queued tasks to live
//!   workers, reaps results and salvages the work of dead workers.
//! - **`worker`**: The execution engine. A pull-based worker with an
//!   in-process executor pool, plus the optional work stealer and
//!   autoscaler and the metrics publisher.
//! - **`api`**: The control plane. HTTP surface for task submission,
//!   worker lifecycle and system metrics.

pub mod api;
pub mod coordinator;
pub mod store;
pub mod task;
pub mod worker;
