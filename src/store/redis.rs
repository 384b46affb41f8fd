//! Redis-backed store.
//!
//! One multiplexed connection serves ordinary commands. Blocking pops get
//! their own connection so a long BLPOP never stalls heartbeats, and every
//! watched transaction opens a fresh connection because WATCH state is
//! per-connection.

use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Commit, Message, Op, SharedStore, Subscription, Transaction};
use crate::error::Result;

pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    blocking: Mutex<MultiplexedConnection>,
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://localhost:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let blocking = client.get_multiplexed_async_connection().await?;
        debug!("connected to redis");
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(blocking),
        })
    }

    /// Simple health check: PING.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn add_to_pipe(pipe: &mut redis::Pipeline, op: Op) {
    match op {
        Op::Set { key, value, ttl } => match ttl {
            Some(ttl) => {
                pipe.pset_ex(key, value, ttl.as_millis().max(1) as u64);
            }
            None => {
                pipe.set(key, value);
            }
        },
        Op::Delete { key } => {
            pipe.del(key);
        }
        Op::Push { key, value } => {
            pipe.rpush(key, value);
        }
        Op::SetAdd { key, member } => {
            pipe.sadd(key, member);
        }
        Op::SetRemove { key, member } => {
            pipe.srem(key, member);
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn blocking_pop_any(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        let mut conn = self.blocking.lock().await;
        let popped: Option<(String, String)> =
            conn.blpop(keys, timeout.as_secs_f64()).await?;
        Ok(popped)
    }

    async fn pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let Some(count) = NonZeroUsize::new(count) else {
            return Ok(Vec::new());
        };
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.lpop(key, Some(count)).await?;
        Ok(values)
    }

    async fn push(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .pset_ex(key, value, ttl.as_millis().max(1) as u64)
                    .await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let found: bool = conn.exists(key).await?;
        Ok(found)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn apply(&self, ops: Vec<Op>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            add_to_pipe(&mut pipe, op);
            pipe.ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("WATCH").arg(keys).query_async(&mut conn).await?;
        Ok(Box::new(RedisTransaction {
            conn,
            ops: Vec::new(),
        }))
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(topic, message).await?;
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for topic in topics {
            pubsub.subscribe(topic).await?;
        }
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            Some(Message {
                topic: msg.get_channel_name().to_string(),
                payload,
            })
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        // Multiplexed connections close when the last handle drops.
        debug!("closing redis store");
        Ok(())
    }
}

struct RedisTransaction {
    conn: MultiplexedConnection,
    ops: Vec<Op>,
}

#[async_trait]
impl Transaction for RedisTransaction {
    async fn exists(&mut self, key: &str) -> Result<bool> {
        let found: bool = self.conn.exists(key).await?;
        Ok(found)
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn.get(key).await?;
        Ok(value)
    }

    fn queue(&mut self, op: Op) {
        self.ops.push(op);
    }

    async fn commit(self: Box<Self>) -> Result<Commit> {
        let RedisTransaction { mut conn, ops } = *self;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            add_to_pipe(&mut pipe, op);
        }
        // EXEC replies nil when a watched key changed.
        let reply: Option<Vec<redis::Value>> = pipe.query_async(&mut conn).await?;
        Ok(match reply {
            Some(_) => Commit::Applied,
            None => Commit::Conflict,
        })
    }

    async fn discard(self: Box<Self>) -> Result<()> {
        let mut conn = self.conn;
        let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
        Ok(())
    }
}
