//! Metric instrument factories for libq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"libq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for libq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("libq")
}

/// Counter: jobs this worker claimed.
/// Labels: `queue`.
pub fn jobs_claimed() -> Counter<u64> {
    meter()
        .u64_counter("libq.jobs.claimed")
        .with_description("Number of jobs claimed")
        .build()
}

/// Counter: claim attempts lost to another worker.
/// Labels: `queue`.
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("libq.jobs.claim_conflicts")
        .with_description("Number of claim attempts that found the job already owned")
        .build()
}

/// Counter: jobs that reached a terminal status.
/// Labels: `queue`, `status` ("complete" | "failed").
pub fn jobs_finished() -> Counter<u64> {
    meter()
        .u64_counter("libq.jobs.finished")
        .with_description("Number of jobs finished")
        .build()
}

/// Histogram: job run time in milliseconds.
/// Labels: `queue`, `status`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("libq.job.duration_ms")
        .with_description("Job execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: heartbeat writes.
/// Labels: `result` ("ok" | "error").
pub fn heartbeats() -> Counter<u64> {
    meter()
        .u64_counter("libq.worker.heartbeats")
        .with_description("Number of worker heartbeats")
        .build()
}

/// Counter: milliseconds spent polling without finding work.
pub fn idle_ms() -> Counter<u64> {
    meter()
        .u64_counter("libq.worker.idle_ms")
        .with_description("Time spent polling empty queues")
        .with_unit("ms")
        .build()
}
