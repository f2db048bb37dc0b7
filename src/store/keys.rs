//! Shared-store key space.
//!
//! Every collection the system persists lives under one of these keys. All
//! components build keys through this module so the layout stays in one place.
//!
//! | Key | Shape | Purpose |
//! |---|---|---|
//! | `tasks:priority:{p}` | sorted set | Ready queue for priority `p` (1-10) |
//! | `tasks:waiting:{id}` | string | Task parked on unmet dependencies |
//! | `tasks:dependencies:{id}` | set | Task ids waiting on dependency `id` |
//! | `workers` | hash | workerId -> last heartbeat (unix seconds) |
//! | `worker:{id}:tasks` | hash | Inbox: assigned, not yet picked up |
//! | `worker:{id}:processing` | hash | Tasks currently executing |
//! | `worker:{id}:results` | hash | Outbox: results awaiting reap |
//! | `results` | hash | Terminal successful results |
//! | `failed_tasks` | hash | Terminal failures and poison pills |
//! | `worker:metrics` | hash | Latest metrics snapshot per worker |
//! | `worker:{id}:metrics:history` | sorted set | Snapshot history, 24h window |

pub const WORKERS: &str = "workers";
pub const RESULTS: &str = "results";
pub const FAILED_TASKS: &str = "failed_tasks";
pub const WORKER_METRICS: &str = "worker:metrics";

pub const PRIORITY_MIN: u8 = 1;
pub const PRIORITY_MAX: u8 = 10;

pub fn priority_queue(priority: u8) -> String {
    format!("tasks:priority:{}", priority)
}

pub fn waiting_task(task_id: &str) -> String {
    format!("tasks:waiting:{}", task_id)
}

pub fn dependency_waiters(task_id: &str) -> String {
    format!("tasks:dependencies:{}", task_id)
}

pub fn worker_inbox(worker_id: &str) -> String {
    format!("worker:{}:tasks", worker_id)
}

pub fn worker_processing(worker_id: &str) -> String {
    format!("worker:{}:processing", worker_id)
}

pub fn worker_outbox(worker_id: &str) -> String {
    format!("worker:{}:results", worker_id)
}

pub fn worker_metrics_history(worker_id: &str) -> String {
    format!("worker:{}:metrics:history", worker_id)
}

/// Pattern matching every inbox bucket, used to discover orphans at startup.
pub const INBOX_PATTERN: &str = "worker:*:tasks";
pub const PROCESSING_PATTERN: &str = "worker:*:processing";

/// Extracts the worker id from a per-worker bucket key such as
/// `worker:abc:tasks`. Returns `None` for keys outside that layout.
pub fn bucket_owner(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("worker:")?;
    let (worker_id, suffix) = rest.rsplit_once(':')?;
    match suffix {
        "tasks" | "processing" | "results" => Some(worker_id),
        _ => None,
    }
}
