//! Worker registration record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a worker publishes about itself on every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub birthday: DateTime<Utc>,
    /// Queue names served (without key prefix).
    pub queues: Vec<String>,
    pub max_jobs: usize,
    /// Concurrency slots currently in use.
    pub running: usize,
    /// Lifetime counters.
    pub completed: u64,
    pub failed: u64,
    /// Accumulated time spent polling without finding work.
    pub idle_ms: u64,
    pub last_job_at: Option<DateTime<Utc>>,
}
