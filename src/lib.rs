//! # libq
//!
//! A job queue worker backed by a shared key-value store.
//!
//! Producers enqueue jobs with [`client::Client`]. A [`worker::Worker`]
//! serves one or more queues: it claims each job exclusively, runs the
//! registered handler (in-process or in a child process) under the job's
//! timeout, and records the outcome on the job. Workers register
//! themselves with a heartbeat-refreshed TTL and listen for operator
//! commands on a per-queue pub/sub topic.
//!
//! The store is reached only through [`store::SharedStore`]; Redis and an
//! in-memory implementation are provided.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod model;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod worker;
