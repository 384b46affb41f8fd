//! Claim protocol: at most one worker runs a job at a time.
//!
//! The claim marker's existence is the lock. It is created under an
//! optimistic transaction watching the marker key, and a lost race is
//! reported as `false`, never retried.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::model::keys;
use crate::store::{Commit, Op, SharedStore};

#[derive(Clone)]
pub struct ClaimProtocol {
    store: Arc<dyn SharedStore>,
    worker_id: String,
    /// Optional marker expiry; `None` keeps the marker until released.
    ttl: Option<Duration>,
}

impl ClaimProtocol {
    pub fn new(store: Arc<dyn SharedStore>, worker_id: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            ttl,
        }
    }

    /// Try to take exclusive ownership of `job_id`.
    ///
    /// `Ok(true)` means this worker now owns the job and wrote exactly one
    /// marker. `Ok(false)` means someone else holds it (or won the race) and
    /// nothing was written. Store errors are returned as errors and must not
    /// be read as a successful claim.
    pub async fn try_claim(&self, job_id: &str) -> Result<bool> {
        let key = keys::claim(job_id);
        let mut tx = self.store.watch(std::slice::from_ref(&key)).await?;

        if tx.exists(&key).await? {
            tx.discard().await?;
            debug!(job_id, "job already claimed");
            return Ok(false);
        }

        tx.queue(Op::Set {
            key,
            value: self.worker_id.clone(),
            ttl: self.ttl,
        });

        match tx.commit().await? {
            Commit::Applied => Ok(true),
            Commit::Conflict => {
                debug!(job_id, "lost claim race");
                Ok(false)
            }
        }
    }

    /// Delete the marker. Called once per successful claim, after the job
    /// reached a terminal status.
    pub async fn release(&self, job_id: &str) -> Result<()> {
        self.store.delete(&keys::claim(job_id)).await
    }

    /// Worker id recorded in the marker, if the job is claimed.
    pub async fn holder(&self, job_id: &str) -> Result<Option<String>> {
        self.store.get(&keys::claim(job_id)).await
    }
}
