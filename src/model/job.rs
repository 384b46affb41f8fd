//! Job records and their lifecycle.
//!
//! A job is one call of a named function with opaque parameters. It is
//! created `queued` by a producer, moved to `running` by the worker that
//! claims it, and ends `complete` or `failed`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque job parameters and results.
pub type Payload = serde_json::Value;

/// Default per-job deadline when the producer does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Job Record
// ---------------------------------------------------------------------------

/// Durable state of one job, stored as JSON under its job key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,

    /// Name the handler is registered under.
    pub func_name: String,

    pub params: Payload,

    /// Deadline for one execution, in milliseconds.
    pub timeout_ms: u64,

    /// Run the handler in a child process instead of in-loop.
    #[serde(default)]
    pub background: bool,

    pub status: Status,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Present only when `complete`.
    pub result: Option<Payload>,

    /// Present only when `failed`.
    pub error: Option<Failure>,
}

impl JobRecord {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Move to `running` and stamp the start time.
    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(Status::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_complete(&mut self, result: Payload) -> Result<()> {
        self.transition(Status::Complete)?;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, failure: Failure) -> Result<()> {
        self.transition(Status::Failed)?;
        self.error = Some(failure);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, to: Status) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Running,
    Complete,
    Failed,
}

impl Status {
    /// Statuses only move forward: queued -> running -> complete | failed.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Queued, Running) | (Running, Complete) | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Complete | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Complete => "complete",
            Status::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Status::Queued),
            "running" => Ok(Status::Running),
            "complete" => Ok(Status::Complete),
            "failed" => Ok(Status::Failed),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// Why a job failed. Stored as the job's error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    FunctionNotFound,
    Timeout,
    HandlerError,
    /// Anything else that went wrong while running the job.
    Internal,
}

impl From<&Error> for Failure {
    fn from(e: &Error) -> Self {
        let kind = match e {
            Error::FunctionNotFound(_) => FailureKind::FunctionNotFound,
            Error::Timeout(_) => FailureKind::Timeout,
            Error::Handler(_) => FailureKind::HandlerError,
            _ => FailureKind::Internal,
        };
        Self {
            kind,
            message: e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for jobs submitted through [`crate::client::Client::enqueue`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) id: Option<String>,
    pub(crate) func_name: String,
    pub(crate) params: Payload,
    pub(crate) timeout: Duration,
    pub(crate) background: bool,
}

impl NewJob {
    pub fn new(func_name: impl Into<String>) -> Self {
        Self {
            id: None,
            func_name: func_name.into(),
            params: serde_json::json!({}),
            timeout: DEFAULT_TIMEOUT,
            background: false,
        }
    }

    /// Use a fixed id instead of a generated one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn params(mut self, params: Payload) -> Self {
        self.params = params;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub(crate) fn into_record(self) -> JobRecord {
        JobRecord {
            id: self
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            func_name: self.func_name,
            params: self.params,
            timeout_ms: self.timeout.as_millis() as u64,
            background: self.background,
            status: Status::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }
}
