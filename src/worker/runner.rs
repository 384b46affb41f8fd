//! Runs one claimed job to a terminal status.
//!
//! The runner owns the job's claim and one concurrency slot for its whole
//! lifetime. Whatever happens inside, it releases the claim and then the
//! slot, and never returns an error to the scheduler.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::handler::{HandlerRegistry, JobContext, ProcessExecutor};
use crate::model::{Failure, FailureKind, JobRecord, Payload, Status, keys};
use crate::store::SharedStore;
use crate::telemetry::job::{record_status_transition, start_job_span};
use crate::telemetry::metrics;

use super::claim::ClaimProtocol;
use super::registration::WorkerStats;

pub struct JobRunner {
    store: Arc<dyn SharedStore>,
    registry: Arc<HandlerRegistry>,
    claims: ClaimProtocol,
    background: ProcessExecutor,
    stats: Arc<WorkerStats>,
    worker_id: String,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn SharedStore>,
        registry: Arc<HandlerRegistry>,
        claims: ClaimProtocol,
        background: ProcessExecutor,
        stats: Arc<WorkerStats>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            claims,
            background,
            stats,
            worker_id: worker_id.into(),
        }
    }

    /// Execute a job this worker has already claimed.
    ///
    /// On return the claim marker is gone (best effort) and `permit` has been
    /// handed back, in that order.
    pub async fn run(&self, job_id: &str, queue: &str, permit: OwnedSemaphorePermit) {
        let started = Instant::now();
        self.stats.job_started();

        let finished = match self.execute(job_id, queue).await {
            Ok(status) => status,
            Err(e) => {
                error!(job_id, queue, error = %e, "job run aborted");
                self.fail_unfinished(job_id, queue, &e).await
            }
        };

        if let Err(e) = self.claims.release(job_id).await {
            warn!(job_id, error = %e, "failed to release claim");
        }
        drop(permit);
        self.stats.job_finished();

        let Some(status) = finished else {
            return;
        };
        match status {
            Status::Complete => self.stats.record_complete(),
            _ => self.stats.record_failed(),
        }
        let labels = [
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("status", status.to_string()),
        ];
        metrics::jobs_finished().add(1, &labels);
        metrics::job_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &labels);
    }

    /// Drive the record from queued to a terminal status.
    ///
    /// `Ok(None)` means the job was not run: its record is missing or it is
    /// no longer queued.
    async fn execute(&self, job_id: &str, queue: &str) -> Result<Option<Status>> {
        let Some(mut job) = self.load(job_id).await? else {
            warn!(job_id, queue, "job record missing, dropping");
            return Ok(None);
        };

        if let Err(e) = job.mark_running() {
            warn!(job_id, status = %job.status, error = %e, "job is not queued, skipping");
            return Ok(None);
        }
        self.save(&job).await?;

        let span = start_job_span(&job.func_name, job_id, queue);
        record_status_transition(&span, "queued", "running");
        info!(parent: &span, background = job.background, "running job");

        match self.call(&job, queue).instrument(span.clone()).await {
            Ok(result) => {
                job.mark_complete(result)?;
                self.save(&job).await?;
                record_status_transition(&span, "running", "complete");
                Ok(Some(Status::Complete))
            }
            Err(e) => {
                warn!(parent: &span, error = %e, "job failed");
                job.mark_failed(Failure::from(&e))?;
                self.save(&job).await?;
                self.store.set_add(&keys::queue_failed(queue), job_id).await?;
                record_status_transition(&span, "running", "failed");
                Ok(Some(Status::Failed))
            }
        }
    }

    /// Resolve and invoke the handler under the job's deadline.
    async fn call(&self, job: &JobRecord, queue: &str) -> Result<Payload> {
        let handler = self
            .registry
            .resolve(&job.func_name)
            .ok_or_else(|| Error::FunctionNotFound(job.func_name.clone()))?;

        let ctx = JobContext {
            job_id: job.id.clone(),
            queue: queue.to_string(),
            worker_id: self.worker_id.clone(),
            cancel: CancellationToken::new(),
        };
        let timeout = job.timeout();

        if job.background {
            return self
                .background
                .execute(&job.func_name, &job.params, &ctx, timeout)
                .await;
        }

        let cancel = ctx.cancel.clone();
        let params = job.params.clone();
        let task = tokio::spawn(async move { handler.call(params, ctx).await });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err(Error::Handler(format!("{e:#}"))),
            Ok(Err(join)) => Err(Error::Handler(panic_message(join))),
            Err(_) => {
                // The task is left running; the token lets it notice.
                cancel.cancel();
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Mark a job that is still running as failed after an internal error.
    async fn fail_unfinished(&self, job_id: &str, queue: &str, cause: &Error) -> Option<Status> {
        let mut job = match self.load(job_id).await {
            Ok(Some(job)) if job.status == Status::Running => job,
            Ok(_) => return None,
            Err(e) => {
                error!(job_id, error = %e, "cannot load job to record failure");
                return None;
            }
        };

        let failure = Failure {
            kind: FailureKind::Internal,
            message: cause.to_string(),
        };
        let recorded = async {
            job.mark_failed(failure)?;
            self.save(&job).await?;
            self.store.set_add(&keys::queue_failed(queue), job_id).await
        };
        match recorded.await {
            Ok(()) => Some(Status::Failed),
            Err(e) => {
                error!(job_id, error = %e, "cannot record job failure");
                None
            }
        }
    }

    async fn load(&self, job_id: &str) -> Result<Option<JobRecord>> {
        match self.store.get(&keys::job(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, job: &JobRecord) -> Result<()> {
        debug!(job_id = %job.id, status = %job.status, "saving job");
        let raw = serde_json::to_string(job)?;
        self.store.set(&keys::job(&job.id), &raw, None).await
    }
}

/// Render a task's panic payload, or its cancellation.
pub(crate) fn panic_message(join: JoinError) -> String {
    if !join.is_panic() {
        return join.to_string();
    }
    let payload = join.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("panicked: {detail}")
}

