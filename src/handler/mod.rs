//! Job handlers and the registry that resolves them by name.
//!
//! The registry is built explicitly at startup and handed to the worker; a
//! job's `func_name` is looked up here and nowhere else.

pub mod builtin;
pub mod process;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::Payload;

pub use process::ProcessExecutor;

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub queue: String,
    pub worker_id: String,
    /// Cancelled when the job's deadline passes. Handlers that watch it can
    /// stop early; ones that don't are abandoned and keep running detached.
    pub cancel: CancellationToken,
}

/// A callable job function.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, params: Payload, ctx: JobContext) -> anyhow::Result<Payload>;
}

/// Adapts an async closure into a [`Handler`]. See [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Payload, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    async fn call(&self, params: Payload, ctx: JobContext) -> anyhow::Result<Payload> {
        (self.0)(params, ctx).await
    }
}

/// Wrap an async closure as a handler.
///
/// ```
/// use libq::handler::{HandlerRegistry, handler_fn};
///
/// let mut registry = HandlerRegistry::new();
/// registry.register("echo", handler_fn(|params, _ctx| async move { Ok(params) }));
/// assert!(registry.contains("echo"));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Payload, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    FnHandler(f)
}

/// Registry of handlers, indexed by function name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Look up a handler by function name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
