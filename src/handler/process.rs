//! Background execution in a child process.
//!
//! The parent spawns `<program> <args...> <func_name>`, writes the params as
//! JSON on the child's stdin and reads the result as JSON from its stdout. A
//! non-zero exit is a handler failure carrying the child's stderr. On timeout
//! the child is killed, so background jobs get real cancellation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{HandlerRegistry, JobContext};
use crate::error::{Error, Result};
use crate::model::Payload;

const ENV_JOB_ID: &str = "LIBQ_JOB_ID";
const ENV_QUEUE: &str = "LIBQ_QUEUE";
const ENV_WORKER_ID: &str = "LIBQ_WORKER_ID";

/// How to launch the child process for background jobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcessExecutor {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-run the current executable as `<exe> exec <func_name>`.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, vec!["exec".to_string()]))
    }

    /// Run `func_name` in a child process, killing it if `timeout` passes.
    pub async fn execute(
        &self,
        func_name: &str,
        params: &Payload,
        ctx: &JobContext,
        timeout: Duration,
    ) -> Result<Payload> {
        let input = serde_json::to_vec(params)?;

        debug!(
            job_id = %ctx.job_id,
            program = %self.program.display(),
            func = func_name,
            "spawning background handler"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(func_name)
            .env(ENV_JOB_ID, &ctx.job_id)
            .env(ENV_QUEUE, &ctx.queue)
            .env(ENV_WORKER_ID, &ctx.worker_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Other("child stdin unavailable".to_string()))?;

        let run = async move {
            let write = async move {
                let written = stdin.write_all(&input).await;
                drop(stdin);
                written
            };
            let (written, output) = tokio::join!(write, child.wait_with_output());
            match written {
                // The child may exit without reading its input.
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                _ => {}
            }
            output
        };

        // Dropping `run` on timeout drops the child, which kills it.
        let output = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| Error::Timeout(timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Handler(format!(
                "process exited with status {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Payload::Null);
        }
        serde_json::from_str(stdout)
            .map_err(|e| Error::Handler(format!("invalid handler output: {e}")))
    }
}

/// Child-side entry: read params from stdin, run the named handler once.
///
/// The caller prints the returned payload to stdout. No deadline is applied
/// here; the parent owns the timeout and kills the process.
pub async fn serve_child(registry: &HandlerRegistry, func_name: &str) -> Result<Payload> {
    let handler = registry
        .resolve(func_name)
        .ok_or_else(|| Error::FunctionNotFound(func_name.to_string()))?;

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    let params: Payload = if input.trim().is_empty() {
        Payload::Null
    } else {
        serde_json::from_str(&input)?
    };

    let ctx = JobContext {
        job_id: std::env::var(ENV_JOB_ID).unwrap_or_default(),
        queue: std::env::var(ENV_QUEUE).unwrap_or_default(),
        worker_id: std::env::var(ENV_WORKER_ID).unwrap_or_default(),
        cancel: CancellationToken::new(),
    };

    handler
        .call(params, ctx)
        .await
        .map_err(|e| Error::Handler(format!("{e:#}")))
}
