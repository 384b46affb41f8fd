//! Typed configuration.
//!
//! [`Config`] comes from environment variables and is loaded once at
//! startup, failing fast if required vars are missing. The store URL is
//! wrapped in `secrecy::SecretString` so credentials never reach the logs.
//!
//! [`WorkerConfig`] holds the worker's tunables. It can be read from a TOML
//! file and is then overridden by command-line flags.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use self::secrets::SecretString;

use crate::error::{Error, Result};
use crate::handler::ProcessExecutor;

#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            redis_url: SecretString::from(required_var("REDIS_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_JOBS: usize = 5;
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);
/// Added to the heartbeat period to get the registration TTL.
pub const REGISTRATION_GRACE: Duration = Duration::from_secs(50);
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(5);

/// How the worker looks for jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStrategy {
    /// Block on all queues at once, one job per wake-up.
    #[default]
    Blocking,
    /// Pick one queue per round and pop as many jobs as there are free slots.
    Iteration,
}

impl std::str::FromStr for PollStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blocking" => Ok(PollStrategy::Blocking),
            "iteration" => Ok(PollStrategy::Iteration),
            other => Err(Error::Config(format!(
                "unknown poll strategy {other:?} (expected blocking or iteration)"
            ))),
        }
    }
}

impl std::fmt::Display for PollStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollStrategy::Blocking => write!(f, "blocking"),
            PollStrategy::Iteration => write!(f, "iteration"),
        }
    }
}

/// Worker tunables. Durations are written as seconds in TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queue names, without key prefix.
    pub queues: Vec<String>,
    /// Random when absent.
    pub worker_id: Option<String>,
    pub max_jobs: usize,
    #[serde(with = "secs")]
    pub heartbeat: Duration,
    /// Defaults to `heartbeat + REGISTRATION_GRACE`.
    #[serde(with = "opt_secs")]
    pub registration_ttl: Option<Duration>,
    /// Upper bound of one blocking pop; also the idle sleep for iteration.
    #[serde(with = "secs")]
    pub poll_delay: Duration,
    pub poll_strategy: PollStrategy,
    /// Stop on SIGINT/SIGTERM.
    pub handle_signals: bool,
    /// Expire claim markers so a crashed worker's jobs are not locked forever.
    #[serde(with = "opt_secs")]
    pub claim_ttl: Option<Duration>,
    /// Consecutive connection failures in the poll loop before giving up.
    /// At least 1; with 1 the first failure is fatal.
    pub max_connection_errors: u32,
    #[serde(with = "secs")]
    pub error_backoff: Duration,
    /// Child process for background jobs. Defaults to `<current exe> exec`.
    pub background: Option<ProcessExecutor>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            worker_id: None,
            max_jobs: DEFAULT_MAX_JOBS,
            heartbeat: DEFAULT_HEARTBEAT,
            registration_ttl: None,
            poll_delay: DEFAULT_POLL_DELAY,
            poll_strategy: PollStrategy::default(),
            handle_signals: true,
            claim_ttl: None,
            max_connection_errors: 5,
            error_backoff: Duration::from_secs(1),
            background: None,
        }
    }
}

impl WorkerConfig {
    /// Defaults, serving `queues`.
    pub fn new<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Read a TOML file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read worker config {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad worker config {}: {e}", path.display())))
    }

    pub fn registration_ttl(&self) -> Duration {
        self.registration_ttl
            .unwrap_or(self.heartbeat + REGISTRATION_GRACE)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(Error::Config("at least one queue is required".to_string()));
        }
        if self.max_jobs == 0 {
            return Err(Error::Config("max_jobs must be at least 1".to_string()));
        }
        if self.heartbeat.is_zero() {
            return Err(Error::Config("heartbeat must be positive".to_string()));
        }
        if self.registration_ttl() <= self.heartbeat {
            return Err(Error::Config(format!(
                "registration ttl {:?} must exceed heartbeat {:?}",
                self.registration_ttl(),
                self.heartbeat
            )));
        }
        if self.poll_delay.is_zero() {
            return Err(Error::Config("poll_delay must be positive".to_string()));
        }
        if self.max_connection_errors == 0 {
            return Err(Error::Config(
                "max_connection_errors must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Split a comma-separated queue list, dropping blanks.
pub fn parse_queues(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect()
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
