//! Job execution span helpers.
//!
//! Provides span creation and status-transition recording for jobs
//! flowing through a worker.

use tracing::Span;

/// Start a span for one job execution.
///
/// The `job.status` field is declared empty and is filled in by
/// [`record_status_transition`].
pub fn start_job_span(func: &str, job_id: &str, queue: &str) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.func" = func,
        "job.id" = job_id,
        "job.queue" = queue,
        "job.status" = tracing::field::Empty,
    )
}

/// Record a status transition event on the given span.
pub fn record_status_transition(span: &Span, from: &str, to: &str) {
    span.record("job.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "status_transition");
    });
}
