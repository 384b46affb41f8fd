//! The worker: polls queues, claims jobs and runs them concurrently.
//!
//! Lifecycle:
//!
//! 1. **Starting**: register, subscribe to command topics, start the
//!    heartbeat and command listener (and signal forwarding if enabled).
//! 2. **Polling**: wait for a free slot, pop job ids, claim them and hand
//!    each claimed job with its slot to a [`JobRunner`] task.
//! 3. **Stopping**: on shutdown or a fatal error, stop background tasks,
//!    unregister, wait for in-flight jobs and close the store.
//!
//! At most `max_jobs` runners exist at once; the semaphore is the only gate.

pub mod claim;
pub mod commands;
pub mod registration;
pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use rand::seq::SliceRandom;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PollStrategy, WorkerConfig};
use crate::error::{Error, Result};
use crate::handler::{HandlerRegistry, ProcessExecutor};
use crate::model::{WorkerInfo, keys};
use crate::store::SharedStore;
use crate::telemetry::metrics;

pub use claim::ClaimProtocol;
pub use registration::{Registration, WorkerStats};
pub use runner::JobRunner;

pub struct Worker {
    id: String,
    config: WorkerConfig,
    store: Arc<dyn SharedStore>,
    /// Full queue key -> queue name.
    queues: HashMap<String, String>,
    slots: Arc<Semaphore>,
    claims: ClaimProtocol,
    runner: Arc<JobRunner>,
    registration: Arc<Registration>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
    running: JoinSet<()>,
}

impl Worker {
    /// Build a worker. Nothing touches the store until [`Worker::run`].
    pub fn new(
        store: Arc<dyn SharedStore>,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let background = match &config.background {
            Some(executor) => executor.clone(),
            None => ProcessExecutor::current_exe()?,
        };

        let slots = Arc::new(Semaphore::new(config.max_jobs));
        let stats = Arc::new(WorkerStats::default());
        let claims = ClaimProtocol::new(Arc::clone(&store), id.clone(), config.claim_ttl);
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store),
            Arc::new(registry),
            claims.clone(),
            background,
            Arc::clone(&stats),
            id.clone(),
        ));
        let registration = Arc::new(Registration::new(
            Arc::clone(&store),
            id.clone(),
            config.queues.clone(),
            config.registration_ttl(),
            config.max_jobs,
            Arc::clone(&stats),
        ));
        let queues = config
            .queues
            .iter()
            .map(|q| (keys::queue(q), q.clone()))
            .collect();

        Ok(Self {
            id,
            config,
            store,
            queues,
            slots,
            claims,
            runner,
            registration,
            stats,
            shutdown: CancellationToken::new(),
            running: JoinSet::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token that stops the worker when cancelled. Grab it before `run`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask the worker to stop after in-flight jobs finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    pub fn info(&self) -> WorkerInfo {
        self.registration.info()
    }

    /// Run until shutdown is requested or a fatal error occurs.
    ///
    /// Returns the fatal error, if any, after the stopping sequence ran.
    pub async fn run(mut self) -> Result<()> {
        info!(
            worker_id = %self.id,
            queues = ?self.config.queues,
            max_jobs = self.config.max_jobs,
            strategy = %self.config.poll_strategy,
            "worker starting"
        );

        self.registration.register().await?;

        let topics: Vec<String> = self
            .config
            .queues
            .iter()
            .map(|q| keys::queue_commands(q))
            .collect();
        let subscription = match self.store.subscribe(&topics).await {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(e) = self.registration.unregister().await {
                    warn!(worker_id = %self.id, error = %e, "failed to unregister");
                }
                return Err(e);
            }
        };

        let listener = tokio::spawn(commands::listen(
            subscription,
            self.id.clone(),
            self.shutdown.clone(),
        ));
        let mut background: Vec<JoinHandle<()>> = Vec::new();
        background.push(tokio::spawn({
            let registration = Arc::clone(&self.registration);
            let period = self.config.heartbeat;
            let stop = self.shutdown.clone();
            async move { registration.heartbeat(period, stop).await }
        }));
        if self.config.handle_signals {
            background.push(crate::shutdown::forward_signals(self.shutdown.clone()));
        }

        info!(worker_id = %self.id, "worker polling");
        let outcome = self.poll_loop().await;
        if let Err(e) = &outcome {
            error!(worker_id = %self.id, error = %e, "worker stopping after fatal error");
        }

        let stopped = self.stop(listener, background).await;
        outcome.and(stopped)
    }

    async fn poll_loop(&mut self) -> Result<()> {
        let mut connection_errors = 0u32;

        while !self.shutdown.is_cancelled() {
            let polled = match self.config.poll_strategy {
                PollStrategy::Blocking => self.poll_blocking().await,
                PollStrategy::Iteration => self.poll_iteration().await,
            };

            match polled {
                Ok(()) => connection_errors = 0,
                Err(e) if e.is_connection() => {
                    connection_errors += 1;
                    warn!(
                        worker_id = %self.id,
                        error = %e,
                        attempt = connection_errors,
                        "store connection error while polling"
                    );
                    if connection_errors >= self.config.max_connection_errors {
                        return Err(e);
                    }
                    self.back_off().await;
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "poll failed");
                    self.back_off().await;
                }
            }

            self.reap()?;
        }

        Ok(())
    }

    /// Wait for a slot, then block on all queues (in random order) for one job.
    async fn poll_blocking(&mut self) -> Result<()> {
        let Some(permit) = self.acquire_slot().await? else {
            return Ok(());
        };

        let mut keys: Vec<String> = self.queues.keys().cloned().collect();
        keys.shuffle(&mut rand::thread_rng());

        let polled_at = Instant::now();
        // Not raced against shutdown: a pop dropped mid-flight can lose the id.
        let popped = self
            .store
            .blocking_pop_any(&keys, self.config.poll_delay)
            .await?;

        match popped {
            Some((key, job_id)) => {
                let queue = self.queue_name(&key);
                self.start(job_id, queue, permit).await
            }
            None => {
                self.stats.add_idle(polled_at.elapsed());
                Ok(())
            }
        }
    }

    /// Take every free slot, then pop that many ids from one random queue.
    async fn poll_iteration(&mut self) -> Result<()> {
        let Some(first) = self.acquire_slot().await? else {
            return Ok(());
        };
        let mut permits = vec![first];
        while let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
            permits.push(permit);
        }

        let key = {
            let keys: Vec<&String> = self.queues.keys().collect();
            keys.choose(&mut rand::thread_rng())
                .map(|k| (*k).clone())
                .ok_or_else(|| Error::Config("no queues configured".to_string()))?
        };

        let polled_at = Instant::now();
        let job_ids = self.store.pop(&key, permits.len()).await?;
        if job_ids.is_empty() {
            drop(permits);
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.config.poll_delay) => {}
            }
            self.stats.add_idle(polled_at.elapsed());
            return Ok(());
        }

        let queue = self.queue_name(&key);
        let mut failed = None;
        for (job_id, permit) in job_ids.into_iter().zip(permits) {
            if let Err(e) = self.start(job_id, queue.clone(), permit).await {
                failed = Some(e);
            }
        }
        failed.map_or(Ok(()), Err)
    }

    /// `None` if shutdown was requested while waiting.
    async fn acquire_slot(&self) -> Result<Option<OwnedSemaphorePermit>> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(None),
            permit = Arc::clone(&self.slots).acquire_owned() => permit
                .map(Some)
                .map_err(|e| Error::Other(format!("job slots closed: {e}"))),
        }
    }

    /// Claim `job_id` and spawn its runner. An unclaimed job gives the slot back.
    async fn start(&mut self, job_id: String, queue: String, permit: OwnedSemaphorePermit) -> Result<()> {
        self.stats.touch_last_job();
        let labels = [KeyValue::new("queue", queue.clone())];

        if !self.claims.try_claim(&job_id).await? {
            metrics::claim_conflicts().add(1, &labels);
            return Ok(());
        }
        metrics::jobs_claimed().add(1, &labels);
        debug!(worker_id = %self.id, job_id = %job_id, queue = %queue, "job claimed");

        let runner = Arc::clone(&self.runner);
        self.running
            .spawn(async move { runner.run(&job_id, &queue, permit).await });
        Ok(())
    }

    /// Collect finished runners. A panicked runner is fatal.
    fn reap(&mut self) -> Result<()> {
        while let Some(joined) = self.running.try_join_next() {
            check_runner(joined)?;
        }
        Ok(())
    }

    async fn back_off(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.error_backoff) => {}
        }
    }

    fn queue_name(&self, key: &str) -> String {
        self.queues
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    async fn stop(
        &mut self,
        listener: JoinHandle<Result<()>>,
        background: Vec<JoinHandle<()>>,
    ) -> Result<()> {
        info!(
            worker_id = %self.id,
            in_flight = self.running.len(),
            "worker stopping"
        );

        self.shutdown.cancel();
        let mut result = match listener.await {
            Ok(listened) => listened,
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "command listener failed");
                Ok(())
            }
        };
        for task in background {
            if let Err(e) = task.await {
                warn!(worker_id = %self.id, error = %e, "background task failed");
            }
        }

        if let Err(e) = self.registration.unregister().await {
            warn!(worker_id = %self.id, error = %e, "failed to unregister");
        }

        while let Some(joined) = self.running.join_next().await {
            if let Err(e) = check_runner(joined) {
                error!(worker_id = %self.id, error = %e, "runner failed during shutdown");
                result = Err(e);
            }
        }

        if let Err(e) = self.store.close().await {
            warn!(worker_id = %self.id, error = %e, "failed to close store");
        }

        info!(
            worker_id = %self.id,
            completed = self.stats.completed(),
            failed = self.stats.failed(),
            "worker stopped"
        );
        result
    }
}

fn check_runner(joined: std::result::Result<(), JoinError>) -> Result<()> {
    match joined {
        Ok(()) => Ok(()),
        Err(e) if e.is_panic() => Err(Error::RunnerPanic(runner::panic_message(e))),
        Err(_) => Ok(()),
    }
}
