//! Core data model.
//!
//! Jobs, worker registrations and operator commands, plus the key layout
//! they are stored under.

pub mod command;
pub mod job;
pub mod keys;
pub mod worker;

pub use command::{Command, CommandAction, CommandTarget};
pub use job::{Failure, FailureKind, JobRecord, NewJob, Payload, Status};
pub use worker::WorkerInfo;
