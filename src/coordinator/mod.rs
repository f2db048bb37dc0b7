//! Coordinator Subsystem
//!
//! The single active coordinator of the platform. Pulls ready tasks from
//! the priority queues, assigns them to live workers, reaps finished
//! results into the global tables and garbage-collects workers whose
//! heartbeats lapse, salvaging their in-flight work.

pub mod coordinator;


pub use coordinator::{Coordinator, CoordinatorConfig};
