//! Producer and operator side of the queue.
//!
//! Workers never use this; it is how jobs get in and how their outcome and
//! the worker fleet are inspected.

use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::model::{Command, JobRecord, NewJob, WorkerInfo, keys};
use crate::store::{Op, SharedStore};

#[derive(Clone)]
pub struct Client {
    store: Arc<dyn SharedStore>,
}

impl Client {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Store the job record and append its id to `queue`, atomically.
    pub async fn enqueue(&self, queue: &str, job: NewJob) -> Result<JobRecord> {
        let record = job.into_record();
        let raw = serde_json::to_string(&record)?;

        self.store
            .apply(vec![
                Op::Set {
                    key: keys::job(&record.id),
                    value: raw,
                    ttl: None,
                },
                Op::Push {
                    key: keys::queue(queue),
                    value: record.id.clone(),
                },
            ])
            .await?;

        info!(job_id = %record.id, queue, func = %record.func_name, "job enqueued");
        Ok(record)
    }

    pub async fn job(&self, id: &str) -> Result<JobRecord> {
        let raw = self
            .store
            .get(&keys::job(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Whether some worker currently holds the job's claim marker.
    pub async fn is_claimed(&self, id: &str) -> Result<bool> {
        self.store.exists(&keys::claim(id)).await
    }

    /// Ids of jobs that failed on `queue`, sorted.
    pub async fn failed_jobs(&self, queue: &str) -> Result<Vec<String>> {
        let mut ids = self.store.set_members(&keys::queue_failed(queue)).await?;
        ids.sort();
        Ok(ids)
    }

    /// Ids of workers indexed under `queue`. May include workers whose
    /// record has already expired.
    pub async fn queue_workers(&self, queue: &str) -> Result<Vec<String>> {
        let mut ids = self.store.set_members(&keys::queue_workers(queue)).await?;
        ids.sort();
        Ok(ids)
    }

    pub async fn worker(&self, id: &str) -> Result<Option<WorkerInfo>> {
        match self.store.get(&keys::worker(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Live workers: indexed ids whose record has not expired.
    pub async fn workers(&self) -> Result<Vec<WorkerInfo>> {
        let mut ids = self.store.set_members(&keys::workers()).await?;
        ids.sort();

        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(info) = self.worker(&id).await? {
                workers.push(info);
            }
        }
        Ok(workers)
    }

    /// Publish `command` on the command topic of `queue`.
    pub async fn send_command(&self, queue: &str, command: &Command) -> Result<()> {
        let raw = serde_json::to_string(command)?;
        self.store.publish(&keys::queue_commands(queue), &raw).await?;
        info!(queue, action = ?command.action, target = ?command.target, "command sent");
        Ok(())
    }
}
