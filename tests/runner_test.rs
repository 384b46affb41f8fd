//! Integration tests for running a claimed job to a terminal status.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use libq::client::Client;
use libq::handler::{HandlerRegistry, ProcessExecutor, builtin, handler_fn};
use libq::model::{FailureKind, JobRecord, NewJob, Status, keys};
use libq::store::{MemoryStore, SharedStore};
use libq::worker::{ClaimProtocol, JobRunner, WorkerStats};
use serde_json::json;
use tokio::sync::Semaphore;

struct Fixture {
    store: MemoryStore,
    client: Client,
    claims: ClaimProtocol,
    runner: JobRunner,
    slots: Arc<Semaphore>,
    stats: Arc<WorkerStats>,
}

fn fixture(registry: HandlerRegistry) -> Fixture {
    fixture_with(registry, ProcessExecutor::new("sh", vec!["-c".into(), "cat".into()]))
}

fn fixture_with(registry: HandlerRegistry, background: ProcessExecutor) -> Fixture {
    let store = MemoryStore::new();
    let shared: Arc<dyn SharedStore> = Arc::new(store.clone());
    let claims = ClaimProtocol::new(Arc::clone(&shared), "w1", None);
    let stats = Arc::new(WorkerStats::default());
    let runner = JobRunner::new(
        Arc::clone(&shared),
        Arc::new(registry),
        claims.clone(),
        background,
        Arc::clone(&stats),
        "w1",
    );
    Fixture {
        store,
        client: Client::new(shared),
        claims,
        runner,
        slots: Arc::new(Semaphore::new(1)),
        stats,
    }
}

impl Fixture {
    /// Enqueue, pop and claim a job, then run it to completion.
    async fn run(&self, job: NewJob) -> JobRecord {
        let record = self.client.enqueue("default", job).await.unwrap();
        let popped = self.store.pop(&keys::queue("default"), 1).await.unwrap();
        assert_eq!(popped, vec![record.id.clone()]);

        assert!(self.claims.try_claim(&record.id).await.unwrap());
        self.run_claimed(&record.id).await;
        self.client.job(&record.id).await.unwrap()
    }

    async fn run_claimed(&self, job_id: &str) {
        let permit = Arc::clone(&self.slots).acquire_owned().await.unwrap();
        assert_eq!(self.slots.available_permits(), 0);
        self.runner.run(job_id, "default", permit).await;
    }

    async fn assert_released(&self, job_id: &str) {
        assert!(!self.client.is_claimed(job_id).await.unwrap());
        assert_eq!(self.slots.available_permits(), 1);
        assert_eq!(self.stats.running(), 0);
    }
}

#[tokio::test]
async fn echo_job_completes_and_releases_claim_and_slot() {
    let f = fixture(builtin::registry());

    let job = f
        .run(NewJob::new("echo").id("j1").params(json!({"x": 1})))
        .await;

    assert_eq!(job.status, Status::Complete);
    assert_eq!(job.result, Some(json!({"x": 1})));
    assert!(job.error.is_none());
    assert!(job.started_at.is_some());
    assert!(job.finished_at.is_some());
    f.assert_released("j1").await;
    assert_eq!(f.stats.completed(), 1);
    assert_eq!(f.stats.failed(), 0);
}

#[tokio::test]
async fn handler_error_fails_job_and_records_it() {
    let f = fixture(builtin::registry());

    let job = f
        .run(NewJob::new("fail").id("j1").params(json!({"message": "bad input"})))
        .await;

    assert_eq!(job.status, Status::Failed);
    let failure = job.error.unwrap();
    assert_eq!(failure.kind, FailureKind::HandlerError);
    assert!(failure.message.contains("bad input"), "{}", failure.message);
    assert_eq!(f.client.failed_jobs("default").await.unwrap(), vec!["j1"]);
    f.assert_released("j1").await;
    assert_eq!(f.stats.failed(), 1);
}

#[tokio::test]
async fn unknown_function_fails_with_function_not_found() {
    let f = fixture(HandlerRegistry::new());

    let job = f.run(NewJob::new("nope").id("j1")).await;

    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.error.unwrap().kind, FailureKind::FunctionNotFound);
    assert!(job.result.is_none());
    f.assert_released("j1").await;
}

#[tokio::test]
async fn slow_handler_times_out_and_is_signalled() {
    let cancelled = Arc::new(AtomicBool::new(false));
    let mut registry = HandlerRegistry::new();
    registry.register("slow", {
        let cancelled = Arc::clone(&cancelled);
        handler_fn(move |_params, ctx| {
            let cancelled = Arc::clone(&cancelled);
            async move {
                ctx.cancel.cancelled().await;
                cancelled.store(true, Ordering::SeqCst);
                Ok(json!(null))
            }
        })
    });
    let f = fixture(registry);

    let job = tokio::time::timeout(
        Duration::from_secs(1),
        f.run(NewJob::new("slow").id("j1").timeout(Duration::from_millis(100))),
    )
    .await
    .expect("runner must not wait past the job timeout");

    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.error.unwrap().kind, FailureKind::Timeout);
    f.assert_released("j1").await;

    tokio::time::timeout(Duration::from_secs(1), async {
        while !cancelled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("handler should observe cancellation");
}

#[tokio::test]
async fn panicking_handler_fails_job() {
    let mut registry = HandlerRegistry::new();
    registry.register(
        "boom",
        handler_fn(|_params, _ctx| async move {
            if true {
                panic!("boom");
            }
            Ok(json!(null))
        }),
    );
    let f = fixture(registry);

    let job = f.run(NewJob::new("boom").id("j1")).await;

    assert_eq!(job.status, Status::Failed);
    let failure = job.error.unwrap();
    assert_eq!(failure.kind, FailureKind::HandlerError);
    assert!(failure.message.contains("boom"), "{}", failure.message);
    f.assert_released("j1").await;
}

#[tokio::test]
async fn anyhow_context_is_kept_in_failure_message() {
    let mut registry = HandlerRegistry::new();
    registry.register(
        "ctx",
        handler_fn(|_params, _ctx| async move {
            Err::<serde_json::Value, _>(anyhow!("disk full")).map_err(|e| e.context("writing report"))
        }),
    );
    let f = fixture(registry);

    let job = f.run(NewJob::new("ctx").id("j1")).await;

    let message = job.error.unwrap().message;
    assert!(message.contains("writing report"), "{message}");
    assert!(message.contains("disk full"), "{message}");
}

#[tokio::test]
async fn background_job_runs_in_child_process() {
    let f = fixture(builtin::registry());

    let job = f
        .run(
            NewJob::new("echo")
                .id("j1")
                .params(json!({"a": [1, 2]}))
                .background(true),
        )
        .await;

    assert_eq!(job.status, Status::Complete);
    assert_eq!(job.result, Some(json!({"a": [1, 2]})));
    f.assert_released("j1").await;
}

#[tokio::test]
async fn background_job_is_killed_on_timeout() {
    let f = fixture_with(
        builtin::registry(),
        ProcessExecutor::new("sh", vec!["-c".into(), "sleep 5".into()]),
    );

    let job = tokio::time::timeout(
        Duration::from_secs(3),
        f.run(
            NewJob::new("echo")
                .id("j1")
                .timeout(Duration::from_millis(200))
                .background(true),
        ),
    )
    .await
    .expect("child must be killed at the deadline");

    assert_eq!(job.status, Status::Failed);
    assert_eq!(job.error.unwrap().kind, FailureKind::Timeout);
    f.assert_released("j1").await;
}

#[tokio::test]
async fn background_job_failure_carries_stderr() {
    let f = fixture_with(
        builtin::registry(),
        ProcessExecutor::new("sh", vec!["-c".into(), "echo oops >&2; exit 2".into()]),
    );

    let job = f.run(NewJob::new("echo").id("j1").background(true)).await;

    assert_eq!(job.status, Status::Failed);
    let failure = job.error.unwrap();
    assert_eq!(failure.kind, FailureKind::HandlerError);
    assert!(failure.message.contains("oops"), "{}", failure.message);
}

#[tokio::test]
async fn missing_record_is_dropped_and_claim_released() {
    let f = fixture(builtin::registry());

    assert!(f.claims.try_claim("ghost").await.unwrap());
    f.run_claimed("ghost").await;

    assert!(f.client.job("ghost").await.is_err());
    f.assert_released("ghost").await;
    assert_eq!(f.stats.completed() + f.stats.failed(), 0);
}

#[tokio::test]
async fn finished_job_is_not_run_again() {
    let f = fixture(builtin::registry());
    let first = f.run(NewJob::new("echo").id("j1").params(json!(1))).await;
    assert_eq!(first.status, Status::Complete);

    // Re-delivered id: the record is already terminal.
    assert!(f.claims.try_claim("j1").await.unwrap());
    f.run_claimed("j1").await;

    let again = f.client.job("j1").await.unwrap();
    assert_eq!(again, first);
    f.assert_released("j1").await;
    assert_eq!(f.stats.completed(), 1);
}

#[tokio::test]
async fn store_failure_mid_run_still_releases_slot() {
    let f = fixture(builtin::registry());
    let record = f.client.enqueue("default", NewJob::new("echo").id("j1")).await.unwrap();
    assert!(f.claims.try_claim(&record.id).await.unwrap());

    // Every store call fails: load, the last-chance failure write and release.
    f.store.inject_failures(100);
    f.run_claimed("j1").await;
    f.store.inject_failures(0);

    assert_eq!(f.slots.available_permits(), 1);
    let job = f.client.job("j1").await.unwrap();
    assert_eq!(job.status, Status::Queued);
}
