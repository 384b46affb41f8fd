//! Worker registration and heartbeat.
//!
//! A worker is visible to the fleet through a TTL'd record plus membership
//! in the global worker set and in each served queue's worker set. The
//! heartbeat rewrites the record more often than it expires; if the
//! heartbeat stops, the record lapses and the worker is considered dead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{WorkerInfo, keys};
use crate::store::{Op, SharedStore};
use crate::telemetry::metrics;

/// Lifetime counters, shared between the scheduler, runners and heartbeat.
#[derive(Debug, Default)]
pub struct WorkerStats {
    completed: AtomicU64,
    failed: AtomicU64,
    idle_ms: AtomicU64,
    running: AtomicUsize,
    last_job_at: Mutex<Option<DateTime<Utc>>>,
}

impl WorkerStats {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Runners currently holding a slot.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms.load(Ordering::Relaxed))
    }

    pub fn last_job_at(&self) -> Option<DateTime<Utc>> {
        *self.last_job_at.lock()
    }

    pub(crate) fn job_started(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_complete(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_idle(&self, idle: Duration) {
        self.idle_ms
            .fetch_add(idle.as_millis() as u64, Ordering::Relaxed);
        metrics::idle_ms().add(idle.as_millis() as u64, &[]);
    }

    pub(crate) fn touch_last_job(&self) {
        *self.last_job_at.lock() = Some(Utc::now());
    }
}

pub struct Registration {
    store: Arc<dyn SharedStore>,
    id: String,
    queues: Vec<String>,
    birthday: DateTime<Utc>,
    ttl: Duration,
    max_jobs: usize,
    stats: Arc<WorkerStats>,
}

impl Registration {
    pub fn new(
        store: Arc<dyn SharedStore>,
        id: impl Into<String>,
        queues: Vec<String>,
        ttl: Duration,
        max_jobs: usize,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            store,
            id: id.into(),
            queues,
            birthday: Utc::now(),
            ttl,
            max_jobs,
            stats,
        }
    }

    /// Current view of this worker.
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            birthday: self.birthday,
            queues: self.queues.clone(),
            max_jobs: self.max_jobs,
            running: self.stats.running(),
            completed: self.stats.completed(),
            failed: self.stats.failed(),
            idle_ms: self.stats.idle().as_millis() as u64,
            last_job_at: self.stats.last_job_at(),
        }
    }

    /// Write the record with a fresh TTL and index it in the worker sets.
    pub async fn register(&self) -> Result<()> {
        let info = serde_json::to_string(&self.info())?;
        let mut ops = vec![
            Op::Set {
                key: keys::worker(&self.id),
                value: info,
                ttl: Some(self.ttl),
            },
            Op::SetAdd {
                key: keys::workers(),
                member: self.id.clone(),
            },
        ];
        ops.extend(self.queues.iter().map(|q| Op::SetAdd {
            key: keys::queue_workers(q),
            member: self.id.clone(),
        }));
        self.store.apply(ops).await
    }

    /// Remove the record and every index entry `register` added.
    pub async fn unregister(&self) -> Result<()> {
        let mut ops = vec![Op::Delete {
            key: keys::worker(&self.id),
        }];
        ops.extend(self.queues.iter().map(|q| Op::SetRemove {
            key: keys::queue_workers(q),
            member: self.id.clone(),
        }));
        ops.push(Op::SetRemove {
            key: keys::workers(),
            member: self.id.clone(),
        });
        self.store.apply(ops).await
    }

    /// Re-register every `period` until `stop` is cancelled.
    ///
    /// A failed write is logged and retried on the next tick.
    pub async fn heartbeat(&self, period: Duration, stop: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; startup already registered.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {}
            }

            debug!(worker_id = %self.id, "heartbeat");
            match self.register().await {
                Ok(()) => metrics::heartbeats().add(1, &[KeyValue::new("result", "ok")]),
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "heartbeat failed");
                    metrics::heartbeats().add(1, &[KeyValue::new("result", "error")]);
                }
            }
        }

        debug!(worker_id = %self.id, "heartbeat stopped");
    }
}
