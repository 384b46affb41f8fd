//! Store key layout.
//!
//! Every key and pub/sub topic the worker touches is built here.

const PREFIX: &str = "libq";

/// List of pending job ids for a queue.
pub fn queue(name: &str) -> String {
    format!("{PREFIX}:queue:{name}")
}

/// Set of worker ids serving a queue.
pub fn queue_workers(name: &str) -> String {
    format!("{PREFIX}:queue:{name}:workers")
}

/// Set of failed job ids for a queue.
pub fn queue_failed(name: &str) -> String {
    format!("{PREFIX}:queue:{name}:failed")
}

/// Pub/sub topic carrying operator commands for a queue.
pub fn queue_commands(name: &str) -> String {
    format!("{PREFIX}:queue:{name}:commands")
}

/// Serialized [`crate::model::JobRecord`].
pub fn job(id: &str) -> String {
    format!("{PREFIX}:job:{id}")
}

/// Claim marker: exists while some worker owns the job.
pub fn claim(job_id: &str) -> String {
    format!("{PREFIX}:claim:{job_id}")
}

/// Serialized [`crate::model::WorkerInfo`], with a TTL.
pub fn worker(id: &str) -> String {
    format!("{PREFIX}:worker:{id}")
}

/// Set of all registered worker ids.
pub fn workers() -> String {
    format!("{PREFIX}:workers")
}
