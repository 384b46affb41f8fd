//! End-to-end tests for the worker loop against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use libq::client::Client;
use libq::config::{PollStrategy, WorkerConfig};
use libq::error::Error;
use libq::handler::{HandlerRegistry, ProcessExecutor, builtin, handler_fn};
use libq::model::{Command, CommandTarget, JobRecord, NewJob, Status, keys};
use libq::store::{MemoryStore, SharedStore};
use libq::worker::{Registration, Worker, WorkerStats};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn config(id: &str) -> WorkerConfig {
    let mut config = WorkerConfig::new(["default"]);
    config.worker_id = Some(id.to_string());
    config.poll_delay = Duration::from_millis(50);
    config.heartbeat = Duration::from_secs(1);
    config.handle_signals = false;
    config.error_backoff = Duration::from_millis(10);
    config.background = Some(ProcessExecutor::new("sh", vec!["-c".into(), "cat".into()]));
    config
}

fn start(
    store: &MemoryStore,
    registry: HandlerRegistry,
    config: WorkerConfig,
) -> (CancellationToken, JoinHandle<libq::error::Result<()>>) {
    let worker = Worker::new(Arc::new(store.clone()), registry, config).unwrap();
    let token = worker.shutdown_token();
    (token, tokio::spawn(worker.run()))
}

async fn wait_for_terminal(client: &Client, id: &str) -> JobRecord {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(job) = client.job(id).await {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

async fn wait_for_worker(client: &Client, id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.worker(id).await.ok().flatten().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker did not register in time");
}

async fn stop(token: CancellationToken, handle: JoinHandle<libq::error::Result<()>>) {
    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop in time")
        .unwrap()
        .unwrap();
}

/// Handler that records peak concurrency while sleeping briefly.
fn gauge(current: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(
        "work",
        handler_fn(move |params, _ctx| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(params)
            }
        }),
    );
    registry
}

// ---------------------------------------------------------------------------
// Job execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueued_job_runs_to_completion() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    client
        .enqueue(
            "default",
            NewJob::new("echo")
                .id("j1")
                .params(json!({"x": 5}))
                .timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let mut cfg = config("w1");
    cfg.max_jobs = 1;
    let (token, handle) = start(&store, builtin::registry(), cfg);

    let job = wait_for_terminal(&client, "j1").await;
    assert_eq!(job.status, Status::Complete);
    assert_eq!(job.result, Some(json!({"x": 5})));

    stop(token, handle).await;
    assert!(!client.is_claimed("j1").await.unwrap());
    assert_eq!(store.len(&keys::queue("default")), 0);
}

#[tokio::test]
async fn failed_job_is_indexed_under_its_queue() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let (token, handle) = start(&store, builtin::registry(), config("w1"));

    client
        .enqueue("default", NewJob::new("fail").id("bad").params(json!({"message": "nope"})))
        .await
        .unwrap();
    client.enqueue("default", NewJob::new("echo").id("good")).await.unwrap();

    assert_eq!(wait_for_terminal(&client, "bad").await.status, Status::Failed);
    assert_eq!(wait_for_terminal(&client, "good").await.status, Status::Complete);
    assert_eq!(client.failed_jobs("default").await.unwrap(), vec!["bad"]);

    stop(token, handle).await;
}

#[tokio::test]
async fn background_job_runs_through_worker() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let (token, handle) = start(&store, builtin::registry(), config("w1"));

    client
        .enqueue(
            "default",
            NewJob::new("echo").id("bg").params(json!("hi")).background(true),
        )
        .await
        .unwrap();

    let job = wait_for_terminal(&client, "bg").await;
    assert_eq!(job.status, Status::Complete);
    assert_eq!(job.result, Some(json!("hi")));

    stop(token, handle).await;
}

#[tokio::test]
async fn concurrency_never_exceeds_max_jobs() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..6 {
        client
            .enqueue("default", NewJob::new("work").id(format!("j{i}")))
            .await
            .unwrap();
    }

    let mut cfg = config("w1");
    cfg.max_jobs = 2;
    let (token, handle) = start(&store, gauge(Arc::clone(&current), Arc::clone(&peak)), cfg);

    for i in 0..6 {
        let job = wait_for_terminal(&client, &format!("j{i}")).await;
        assert_eq!(job.status, Status::Complete);
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    stop(token, handle).await;
}

#[tokio::test]
async fn iteration_strategy_fills_free_slots() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..5 {
        client
            .enqueue("default", NewJob::new("work").id(format!("j{i}")))
            .await
            .unwrap();
    }

    let mut cfg = config("w1");
    cfg.max_jobs = 3;
    cfg.poll_strategy = PollStrategy::Iteration;
    let (token, handle) = start(&store, gauge(Arc::clone(&current), Arc::clone(&peak)), cfg);

    for i in 0..5 {
        let job = wait_for_terminal(&client, &format!("j{i}")).await;
        assert_eq!(job.status, Status::Complete);
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);

    stop(token, handle).await;
}

#[tokio::test]
async fn two_workers_run_each_job_once() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let runs = Arc::new(AtomicUsize::new(0));

    let registry = {
        let runs = Arc::clone(&runs);
        let mut registry = HandlerRegistry::new();
        registry.register(
            "count",
            handler_fn(move |_params, _ctx| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
        );
        registry
    };

    let (t1, h1) = start(&store, registry.clone(), config("w1"));
    let (t2, h2) = start(&store, registry, config("w2"));

    for i in 0..20 {
        client
            .enqueue("default", NewJob::new("count").id(format!("j{i}")))
            .await
            .unwrap();
    }
    for i in 0..20 {
        wait_for_terminal(&client, &format!("j{i}")).await;
    }
    assert_eq!(runs.load(Ordering::SeqCst), 20);

    stop(t1, h1).await;
    stop(t2, h2).await;
}

// ---------------------------------------------------------------------------
// Registration and commands
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_registers_and_unregisters() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let (token, handle) = start(&store, builtin::registry(), config("w1"));

    wait_for_worker(&client, "w1").await;
    let info = client.worker("w1").await.unwrap().unwrap();
    assert_eq!(info.queues, vec!["default"]);
    assert_eq!(info.max_jobs, 5);
    assert_eq!(client.queue_workers("default").await.unwrap(), vec!["w1"]);
    assert!(store.ttl(&keys::worker("w1")).is_some());

    stop(token, handle).await;
    assert!(client.worker("w1").await.unwrap().is_none());
    assert!(client.workers().await.unwrap().is_empty());
    assert!(client.queue_workers("default").await.unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_command_stops_addressed_worker() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let (_t1, h1) = start(&store, builtin::registry(), config("w1"));
    let (t2, h2) = start(&store, builtin::registry(), config("w2"));
    wait_for_worker(&client, "w1").await;
    wait_for_worker(&client, "w2").await;

    let command = Command::shutdown(CommandTarget::Worker("w1".into()));
    tokio::time::timeout(Duration::from_secs(5), async {
        // Resend until the listener has subscribed and acted.
        while !h1.is_finished() {
            client.send_command("default", &command).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("w1 did not stop");

    h1.await.unwrap().unwrap();
    assert!(!h2.is_finished());
    assert!(client.worker("w1").await.unwrap().is_none());
    assert!(client.worker("w2").await.unwrap().is_some());

    stop(t2, h2).await;
}

#[tokio::test]
async fn shutdown_command_for_all_stops_every_worker() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let (_t1, h1) = start(&store, builtin::registry(), config("w1"));
    let (_t2, h2) = start(&store, builtin::registry(), config("w2"));
    wait_for_worker(&client, "w1").await;
    wait_for_worker(&client, "w2").await;

    let command = Command::shutdown(CommandTarget::All);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !(h1.is_finished() && h2.is_finished()) {
            client.send_command("default", &command).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("workers did not stop");

    h1.await.unwrap().unwrap();
    h2.await.unwrap().unwrap();
    assert!(client.workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_and_unknown_commands_are_ignored() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let (token, handle) = start(&store, builtin::registry(), config("w1"));
    wait_for_worker(&client, "w1").await;

    let topic = keys::queue_commands("default");
    for _ in 0..5 {
        store.publish(&topic, "not json").await.unwrap();
        store
            .publish(&topic, r#"{"action":"pause","target":"all","key":"k"}"#)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!handle.is_finished());

    // Still serving.
    client.enqueue("default", NewJob::new("echo").id("j1")).await.unwrap();
    assert_eq!(wait_for_terminal(&client, "j1").await.status, Status::Complete);

    stop(token, handle).await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_registration_alive_until_stopped() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let registration = Arc::new(Registration::new(
        Arc::new(store.clone()),
        "w1",
        vec!["default".to_string()],
        Duration::from_secs(3),
        2,
        Arc::new(WorkerStats::default()),
    ));
    registration.register().await.unwrap();

    let stop = CancellationToken::new();
    let heartbeat = tokio::spawn({
        let registration = Arc::clone(&registration);
        let stop = stop.clone();
        async move { registration.heartbeat(Duration::from_secs(1), stop).await }
    });

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(client.worker("w1").await.unwrap().is_some());

    stop.cancel();
    heartbeat.await.unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(client.worker("w1").await.unwrap().is_none());
    // The stale index entry is filtered out.
    assert!(client.workers().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn heartbeat_survives_store_errors() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let registration = Arc::new(Registration::new(
        Arc::new(store.clone()),
        "w1",
        vec!["default".to_string()],
        Duration::from_secs(3),
        1,
        Arc::new(WorkerStats::default()),
    ));
    registration.register().await.unwrap();

    let stop = CancellationToken::new();
    let heartbeat = tokio::spawn({
        let registration = Arc::clone(&registration);
        let stop = stop.clone();
        async move { registration.heartbeat(Duration::from_secs(1), stop).await }
    });

    // The beats at 1s and 2s fail; the one at 3s renews the record just as
    // the original TTL lapses.
    store.inject_failures(2);
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(client.worker("w1").await.unwrap().is_some());

    stop.cancel();
    heartbeat.await.unwrap();
}

/// Poll the worker's published record until `running` equals `expected`.
async fn wait_for_running(client: &Client, id: &str, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Some(info)) = client.worker(id).await {
                if info.running == expected {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("worker {id} never reported {expected} running"));
}

#[tokio::test]
async fn idle_worker_reports_no_running_jobs() {
    for strategy in [PollStrategy::Blocking, PollStrategy::Iteration] {
        let store = MemoryStore::new();
        let client = Client::new(Arc::new(store.clone()));
        let mut cfg = config("w1");
        cfg.max_jobs = 4;
        cfg.heartbeat = Duration::from_millis(100);
        cfg.poll_strategy = strategy;
        let (token, handle) = start(&store, builtin::registry(), cfg);
        wait_for_worker(&client, "w1").await;

        // Several heartbeats land while the poll loop waits on an empty queue.
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let info = client.worker("w1").await.unwrap().unwrap();
            assert_eq!(info.running, 0, "{strategy}");
        }

        stop(token, handle).await;
    }
}

#[tokio::test]
async fn busy_worker_reports_running_jobs() {
    let release = Arc::new(Notify::new());
    let mut registry = HandlerRegistry::new();
    registry.register("hold", {
        let release = Arc::clone(&release);
        handler_fn(move |params, _ctx| {
            let release = Arc::clone(&release);
            async move {
                release.notified().await;
                Ok(params)
            }
        })
    });

    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let mut cfg = config("w1");
    cfg.max_jobs = 4;
    cfg.heartbeat = Duration::from_millis(100);
    let (token, handle) = start(&store, registry, cfg);
    wait_for_worker(&client, "w1").await;

    client.enqueue("default", NewJob::new("hold").id("j1")).await.unwrap();
    wait_for_running(&client, "w1", 1).await;

    release.notify_one();
    assert_eq!(wait_for_terminal(&client, "j1").await.status, Status::Complete);
    wait_for_running(&client, "w1", 0).await;

    stop(token, handle).await;
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_recovers_from_brief_store_outage() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let (token, handle) = start(&store, builtin::registry(), config("w1"));
    wait_for_worker(&client, "w1").await;

    // Fewer consecutive failures than max_connection_errors: the poll loop
    // backs off and keeps going.
    store.inject_failures(3);
    tokio::time::timeout(Duration::from_secs(5), async {
        while client
            .enqueue("default", NewJob::new("echo").id("j1").params(json!({"x": 1})))
            .await
            .is_err()
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("store never recovered");

    let job = wait_for_terminal(&client, "j1").await;
    assert_eq!(job.status, Status::Complete);
    assert_eq!(job.result, Some(json!({"x": 1})));
    assert!(!handle.is_finished());

    stop(token, handle).await;
}

#[tokio::test]
async fn repeated_connection_errors_stop_the_worker() {
    let store = MemoryStore::new();
    let client = Client::new(Arc::new(store.clone()));
    let mut cfg = config("w1");
    cfg.max_connection_errors = 3;
    let (_token, handle) = start(&store, builtin::registry(), cfg);
    wait_for_worker(&client, "w1").await;

    store.inject_failures(usize::MAX);
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker should give up")
        .unwrap();
    store.inject_failures(0);

    let err = result.unwrap_err();
    assert!(err.is_connection(), "{err}");
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let store = MemoryStore::new();

    let empty = WorkerConfig::new(Vec::<String>::new());
    assert!(matches!(
        Worker::new(Arc::new(store.clone()), builtin::registry(), empty),
        Err(Error::Config(_))
    ));

    let mut zero = config("w1");
    zero.max_jobs = 0;
    assert!(matches!(
        Worker::new(Arc::new(store), builtin::registry(), zero),
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn worker_ids_are_random_when_unset() {
    let store = MemoryStore::new();
    let mut cfg = config("unused");
    cfg.worker_id = None;

    let a = Worker::new(Arc::new(store.clone()), builtin::registry(), cfg.clone()).unwrap();
    let b = Worker::new(Arc::new(store), builtin::registry(), cfg).unwrap();
    assert_ne!(a.id(), b.id());
    assert!(!a.id().is_empty());
}
