//! libq CLI: run a worker, submit and inspect jobs, command the fleet.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use libq::client::Client;
use libq::config::secrets::{ExposeSecret, redact_url};
use libq::config::{Config, PollStrategy, WorkerConfig, parse_queues};
use libq::handler::{builtin, process};
use libq::model::{Command as WorkerCommand, CommandTarget, NewJob};
use libq::store::RedisStore;
use libq::telemetry::{TelemetryConfig, init_telemetry};
use libq::worker::Worker;

#[derive(Parser)]
#[command(name = "libq", about = "Job queue worker and operator tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker until shutdown
    Worker {
        /// Comma-separated queue names
        #[arg(long, short)]
        queues: Option<String>,
        /// Worker id (random if omitted)
        #[arg(long)]
        id: Option<String>,
        /// Maximum concurrent jobs
        #[arg(long)]
        max_jobs: Option<usize>,
        /// Heartbeat period in seconds
        #[arg(long)]
        heartbeat_secs: Option<u64>,
        /// Poll wait in seconds
        #[arg(long)]
        poll_delay_secs: Option<u64>,
        /// blocking or iteration
        #[arg(long)]
        poll_strategy: Option<PollStrategy>,
        /// Ignore SIGINT/SIGTERM
        #[arg(long)]
        no_signals: bool,
        /// TOML worker config; flags override it
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run one handler with params on stdin (used for background jobs)
    #[command(hide = true)]
    Exec {
        func_name: String,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// List live workers
    Workers,
    /// Ask workers serving a queue to shut down
    Shutdown {
        queue: String,
        /// Only this worker id (all workers if omitted)
        #[arg(long)]
        target: Option<String>,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Enqueue a job
    Submit {
        queue: String,
        func_name: String,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
        /// Timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
        /// Run in a child process
        #[arg(long)]
        background: bool,
    },
    /// Show a job
    Show { id: String },
    /// List failed job ids for a queue
    Failed { queue: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Exec { func_name } => cmd_exec(func_name).await,
        Command::Worker {
            queues,
            id,
            max_jobs,
            heartbeat_secs,
            poll_delay_secs,
            poll_strategy,
            no_signals,
            config,
        } => {
            let mut worker_config = match config {
                Some(path) => WorkerConfig::from_file(&path)?,
                None => WorkerConfig::default(),
            };
            if let Some(queues) = queues {
                worker_config.queues = parse_queues(&queues);
            }
            if id.is_some() {
                worker_config.worker_id = id;
            }
            if let Some(n) = max_jobs {
                worker_config.max_jobs = n;
            }
            if let Some(secs) = heartbeat_secs {
                worker_config.heartbeat = Duration::from_secs(secs);
            }
            if let Some(secs) = poll_delay_secs {
                worker_config.poll_delay = Duration::from_secs(secs);
            }
            if let Some(strategy) = poll_strategy {
                worker_config.poll_strategy = strategy;
            }
            if no_signals {
                worker_config.handle_signals = false;
            }
            cmd_worker(worker_config).await
        }
        Command::Job { action } => {
            let client = connect_client().await?;
            match action {
                JobAction::Submit {
                    queue,
                    func_name,
                    params,
                    timeout_secs,
                    background,
                } => {
                    cmd_job_submit(&client, queue, func_name, params, timeout_secs, background)
                        .await
                }
                JobAction::Show { id } => cmd_job_show(&client, id).await,
                JobAction::Failed { queue } => cmd_job_failed(&client, queue).await,
            }
        }
        Command::Workers => cmd_workers(&connect_client().await?).await,
        Command::Shutdown { queue, target } => {
            cmd_shutdown(&connect_client().await?, queue, target).await
        }
    }
}

async fn connect_client() -> anyhow::Result<Client> {
    let config = Config::from_env()?;
    let store = RedisStore::connect(config.redis_url.expose_secret()).await?;
    Ok(Client::new(Arc::new(store)))
}

async fn cmd_worker(worker_config: WorkerConfig) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "libq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    tracing::info!(store = %redact_url(&config.redis_url), "connecting to store");
    let store = RedisStore::connect(config.redis_url.expose_secret()).await?;
    store.health_check().await?;

    let worker = Worker::new(Arc::new(store), builtin::registry(), worker_config)?;
    worker.run().await?;
    Ok(())
}

/// Child side of a background job. Logs are not initialized: stdout carries
/// the result and stderr is reported by the parent on failure.
async fn cmd_exec(func_name: String) -> anyhow::Result<()> {
    let registry = builtin::registry();
    let result = process::serve_child(&registry, &func_name).await?;
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

async fn cmd_job_submit(
    client: &Client,
    queue: String,
    func_name: String,
    params: Option<String>,
    timeout_secs: u64,
    background: bool,
) -> anyhow::Result<()> {
    let params: serde_json::Value = match params {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let job = NewJob::new(func_name)
        .params(params)
        .timeout(Duration::from_secs(timeout_secs))
        .background(background);
    let record = client.enqueue(&queue, job).await?;

    println!("Enqueued: {} on {queue}", record.id);
    Ok(())
}

async fn cmd_job_show(client: &Client, id: String) -> anyhow::Result<()> {
    let job = client.job(&id).await?;

    println!("ID:         {}", job.id);
    println!("Function:   {}", job.func_name);
    println!("Status:     {}", job.status);
    println!("Background: {}", job.background);
    println!("Timeout:    {:?}", job.timeout());
    println!("Params:     {}", serde_json::to_string_pretty(&job.params)?);
    println!("Created:    {}", job.created_at);
    if let Some(started) = job.started_at {
        println!("Started:    {started}");
    }
    if let Some(finished) = job.finished_at {
        println!("Finished:   {finished}");
    }
    if let Some(ref result) = job.result {
        println!("---");
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }
    if let Some(ref failure) = job.error {
        println!("---");
        println!("Error:      {:?}: {}", failure.kind, failure.message);
    }
    if client.is_claimed(&id).await? {
        println!("Claimed:    yes");
    }
    Ok(())
}

async fn cmd_job_failed(client: &Client, queue: String) -> anyhow::Result<()> {
    let ids = client.failed_jobs(&queue).await?;
    if ids.is_empty() {
        println!("No failed jobs on {queue}.");
        return Ok(());
    }
    for id in &ids {
        println!("{id}");
    }
    println!("\n{} job(s)", ids.len());
    Ok(())
}

async fn cmd_workers(client: &Client) -> anyhow::Result<()> {
    let workers = client.workers().await?;
    if workers.is_empty() {
        println!("No live workers.");
        return Ok(());
    }

    println!(
        "{:<32}  {:<20}  {:>7}  {:>9}  {:>6}  BIRTHDAY",
        "ID", "QUEUES", "RUNNING", "COMPLETED", "FAILED"
    );
    println!("{}", "-".repeat(100));
    for worker in &workers {
        println!(
            "{:<32}  {:<20}  {:>3}/{:<3}  {:>9}  {:>6}  {}",
            worker.id,
            worker.queues.join(","),
            worker.running,
            worker.max_jobs,
            worker.completed,
            worker.failed,
            worker.birthday.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} worker(s)", workers.len());
    Ok(())
}

async fn cmd_shutdown(client: &Client, queue: String, target: Option<String>) -> anyhow::Result<()> {
    let target = match target {
        Some(id) => CommandTarget::Worker(id),
        None => CommandTarget::All,
    };
    let command = WorkerCommand::shutdown(target);
    client.send_command(&queue, &command).await?;
    println!("Sent shutdown ({}) to {queue}", command.key);
    Ok(())
}

