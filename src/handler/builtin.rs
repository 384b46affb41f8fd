//! Handlers shipped with the `libq` binary.

use std::time::Duration;

use serde_json::json;

use super::{HandlerRegistry, handler_fn};

/// `echo` returns its params, `sleep` waits `{"secs": f64}`, `fail` errors
/// with `{"message": str}`.
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("echo", handler_fn(|params, _ctx| async move { Ok(params) }))
        .register(
            "sleep",
            handler_fn(|params, ctx| async move {
                let secs = params.get("secs").and_then(|v| v.as_f64()).unwrap_or(1.0);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))) => {}
                    _ = ctx.cancel.cancelled() => anyhow::bail!("sleep cancelled"),
                }
                Ok(json!({ "slept": secs }))
            }),
        )
        .register(
            "fail",
            handler_fn(|params, _ctx| async move {
                let message = params
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("requested failure")
                    .to_string();
                Err(anyhow::anyhow!(message))
            }),
        );
    registry
}
