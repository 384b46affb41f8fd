//! In-process store.
//!
//! Implements the full [`SharedStore`] contract against shared memory so a
//! fleet of workers in one process (tests, local runs) coordinates exactly as
//! it would through Redis. Clones share state.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;

use super::{Commit, Message, Op, SharedStore, Subscription, Transaction};
use crate::error::{Error, Result};

const TOPIC_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    values: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    /// Per-key write stamp, compared on commit.
    versions: HashMap<String, u64>,
    clock: u64,
}

impl State {
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }

    /// Drop `key` if its TTL has passed. Expiry counts as a write.
    fn expire(&mut self, key: &str) {
        let expired = self
            .values
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.values.remove(key);
            self.touch(key);
        }
    }

    fn version(&mut self, key: &str) -> u64 {
        self.expire(key);
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn get(&mut self, key: &str) -> Option<String> {
        self.expire(key);
        self.values.get(key).map(|e| e.value.clone())
    }

    fn exists(&mut self, key: &str) -> bool {
        self.expire(key);
        self.values.contains_key(key)
            || self.lists.get(key).is_some_and(|l| !l.is_empty())
            || self.sets.get(key).is_some_and(|s| !s.is_empty())
    }

    fn pop_front(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_front();
        if list.is_empty() {
            self.lists.remove(key);
        }
        if value.is_some() {
            self.touch(key);
        }
        value
    }

    /// Apply one write. Returns true if a list grew.
    fn apply(&mut self, op: Op) -> bool {
        match op {
            Op::Set { key, value, ttl } => {
                let expires_at = ttl.map(|t| Instant::now() + t);
                self.touch(&key);
                self.values.insert(key, Entry { value, expires_at });
                false
            }
            Op::Delete { key } => {
                self.values.remove(&key);
                self.lists.remove(&key);
                self.sets.remove(&key);
                self.touch(&key);
                false
            }
            Op::Push { key, value } => {
                self.touch(&key);
                self.lists.entry(key).or_default().push_back(value);
                true
            }
            Op::SetAdd { key, member } => {
                self.touch(&key);
                self.sets.entry(key).or_default().insert(member);
                false
            }
            Op::SetRemove { key, member } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    set.remove(&member);
                    if set.is_empty() {
                        self.sets.remove(&key);
                    }
                }
                self.touch(&key);
                false
            }
        }
    }
}

struct Inner {
    state: Mutex<State>,
    pushed: Notify,
    topics: broadcast::Sender<Message>,
    /// Remaining operations that fail with a connection error.
    failures: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (topics, _) = broadcast::channel(TOPIC_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                pushed: Notify::new(),
                topics,
                failures: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `n` store operations fail with a connection error.
    pub fn inject_failures(&self, n: usize) {
        self.inner.failures.store(n, Ordering::SeqCst);
    }

    /// Remaining time to live of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.inner.state.lock();
        state.expire(key);
        state
            .values
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Length of a list.
    pub fn len(&self, key: &str) -> usize {
        self.inner.state.lock().lists.get(key).map_or(0, |l| l.len())
    }

    fn check(&self) -> Result<()> {
        let taken = self
            .inner
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(Error::StoreConnection("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn write(&self, op: Op) {
        let pushed = self.inner.state.lock().apply(op);
        if pushed {
            self.inner.pushed.notify_waiters();
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn blocking_pop_any(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        self.check()?;
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before looking so a push in between is not missed.
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                for key in keys {
                    if let Some(value) = state.pop_front(key) {
                        return Ok(Some((key.clone(), value)));
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        self.check()?;
        let mut state = self.inner.state.lock();
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            match state.pop_front(key) {
                Some(v) => out.push(v),
                None => break,
            }
        }
        Ok(out)
    }

    async fn push(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.write(Op::Push {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.inner.state.lock().get(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        self.write(Op::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.write(Op::Delete {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.inner.state.lock().exists(key))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.check()?;
        self.write(Op::SetAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        self.check()?;
        self.write(Op::SetRemove {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        let state = self.inner.state.lock();
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn apply(&self, ops: Vec<Op>) -> Result<()> {
        self.check()?;
        let mut pushed = false;
        {
            let mut state = self.inner.state.lock();
            for op in ops {
                pushed |= state.apply(op);
            }
        }
        if pushed {
            self.inner.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>> {
        self.check()?;
        let watched = {
            let mut state = self.inner.state.lock();
            keys.iter()
                .map(|k| (k.clone(), state.version(k)))
                .collect()
        };
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            watched,
            ops: Vec::new(),
        }))
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<()> {
        self.check()?;
        // No subscribers is not an error.
        let _ = self.inner.topics.send(Message {
            topic: topic.to_string(),
            payload: message.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription> {
        self.check()?;
        let rx = self.inner.topics.subscribe();
        let topics: HashSet<String> = topics.iter().cloned().collect();
        let stream = futures_util::stream::unfold((rx, topics), |(mut rx, topics)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if topics.contains(&msg.topic) => return Some((msg, (rx, topics))),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        // State is shared by every clone; one worker closing must not end it.
        Ok(())
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    watched: Vec<(String, u64)>,
    ops: Vec<Op>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn exists(&mut self, key: &str) -> Result<bool> {
        self.store.check()?;
        Ok(self.store.inner.state.lock().exists(key))
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        self.store.check()?;
        Ok(self.store.inner.state.lock().get(key))
    }

    fn queue(&mut self, op: Op) {
        self.ops.push(op);
    }

    async fn commit(self: Box<Self>) -> Result<Commit> {
        self.store.check()?;
        let this = *self;
        let mut pushed = false;
        {
            let mut state = this.store.inner.state.lock();
            for (key, seen) in &this.watched {
                if state.version(key) != *seen {
                    return Ok(Commit::Conflict);
                }
            }
            for op in this.ops {
                pushed |= state.apply(op);
            }
        }
        if pushed {
            this.store.inner.pushed.notify_waiters();
        }
        Ok(Commit::Applied)
    }

    async fn discard(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
