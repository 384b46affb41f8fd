//! Error types for libq.

use std::time::Duration;

use thiserror::Error;

use crate::model::job::Status;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("function {0} not found")]
    FunctionNotFound(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("store connection error: {0}")]
    StoreConnection(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("runner task panicked: {0}")]
    RunnerPanic(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Connection-level store failures count toward the worker's exit bound.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::StoreConnection(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            Error::StoreConnection(e.to_string())
        } else {
            Error::Store(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
