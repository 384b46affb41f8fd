//! Shared store boundary.
//!
//! Everything workers coordinate through lives behind [`SharedStore`]: job
//! queues (lists), records and claim markers (keys with optional TTL),
//! registration indexes (sets), optimistic transactions (watch + commit) and
//! pub/sub. [`MemoryStore`] implements it in-process; [`RedisStore`] talks to
//! a Redis server.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// A write queued inside a transaction or batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    Push {
        key: String,
        value: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
}

/// Outcome of committing a watched transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Applied,
    /// A watched key was written by someone else; nothing was applied.
    Conflict,
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
}

/// Stream of messages for the topics passed to [`SharedStore::subscribe`].
///
/// Dropping it unsubscribes.
pub type Subscription = BoxStream<'static, Message>;

#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Pop the head of the first non-empty list among `keys`, waiting up to
    /// `timeout` for one to receive a value. Returns `(key, value)`.
    async fn blocking_pop_any(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>>;

    /// Pop up to `count` values from the head of a list without waiting.
    async fn pop(&self, key: &str, count: usize) -> Result<Vec<String>>;

    /// Append to the tail of a list.
    async fn push(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Apply several writes as one atomic batch (no watch).
    async fn apply(&self, ops: Vec<Op>) -> Result<()>;

    /// Open an optimistic transaction watching `keys`.
    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>>;

    async fn publish(&self, topic: &str, message: &str) -> Result<()>;

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription>;

    /// Release connections. The store must not be used afterwards.
    async fn close(&self) -> Result<()>;
}

/// Watch-then-write context returned by [`SharedStore::watch`].
///
/// Reads observe current state; writes are queued and only applied by
/// [`Transaction::commit`], which reports [`Commit::Conflict`] if any watched
/// key changed since the watch began.
#[async_trait]
pub trait Transaction: Send {
    async fn exists(&mut self, key: &str) -> Result<bool>;

    async fn get(&mut self, key: &str) -> Result<Option<String>>;

    fn queue(&mut self, op: Op);

    async fn commit(self: Box<Self>) -> Result<Commit>;

    /// Abandon the transaction without writing.
    async fn discard(self: Box<Self>) -> Result<()>;
}
