//! Shared Store Abstraction
//!
//! The shared store is the single rendezvous point between the coordinator,
//! the workers and the control plane. It exposes exactly the primitives the
//! platform needs: sorted sets for the ready queues, hashes for the
//! per-worker buckets and result tables, sets for dependency tracking and
//! plain keys for parked tasks.
//!
//! Two implementations exist:
//! - **`RedisStore`**: the production backend, one multiplexed async
//!   connection shared by every loop in the process.
//! - **`MemoryStore`**: an in-process backend with the same ordering and
//!   uniqueness semantics, used by the test suites.
//!
//! Only single-key atomicity is assumed. Multi-step transfers end in a
//! create-if-absent on the destination hash (`hash_set_nx`), which is what
//! keeps assignment and work stealing from double-placing a task.

pub mod keys;
pub mod memory;
pub mod redis;


use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryStore;
pub use redis::RedisStore;

#[async_trait]
pub trait SharedStore: Send + Sync {
    // Sorted sets (ready queues, metric history). Members are unique;
    // iteration order is ascending score, ties ordered by member.
    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zset_range(&self, key: &str, limit: usize) -> Result<Vec<String>>;
    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool>;
    async fn zset_len(&self, key: &str) -> Result<u64>;
    async fn zset_trim_below(&self, key: &str, max_score: f64) -> Result<()>;

    // Hashes (worker buckets, result tables, heartbeat registry).
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;
    /// Create-if-absent. Returns `false` when the field already existed,
    /// leaving the stored value untouched.
    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_del(&self, key: &str, field: &str) -> Result<()>;
    async fn hash_all(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hash_len(&self, key: &str) -> Result<u64>;
    async fn hash_exists(&self, key: &str, field: &str) -> Result<bool>;

    // Sets (reverse dependency index).
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    // Plain keys (parked tasks).
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, keys: &[String]) -> Result<()>;
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>>;

    /// Registers a worker and clears remnants of a previous instance with
    /// the same id, as one atomic group where the backend supports it.
    async fn register_worker(&self, worker_id: &str, now_secs: i64) -> Result<()>;
}

/// Clears every queue, per-worker bucket and result table, returning the
/// store to a known-empty state. Used by the coordinator's clean start and
/// by the control plane's system reset.
pub async fn purge_all(store: &Arc<dyn SharedStore>) -> Result<()> {
    let mut targets: Vec<String> = (keys::PRIORITY_MIN..=keys::PRIORITY_MAX)
        .map(keys::priority_queue)
        .collect();

    // Buckets of registered workers plus any orphans from a crashed run.
    for worker_id in store.hash_all(keys::WORKERS).await?.into_keys() {
        targets.push(keys::worker_inbox(&worker_id));
        targets.push(keys::worker_processing(&worker_id));
        targets.push(keys::worker_outbox(&worker_id));
    }
    for pattern in [keys::INBOX_PATTERN, keys::PROCESSING_PATTERN, "worker:*:results"] {
        targets.extend(store.keys_matching(pattern).await?);
    }
    targets.sort();
    targets.dedup();

    targets.push(keys::WORKERS.to_string());
    targets.push(keys::RESULTS.to_string());
    targets.push(keys::FAILED_TASKS.to_string());

    store.delete(&targets).await
}
