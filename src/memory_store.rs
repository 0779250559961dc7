//! In-process fallback store.
//!
//! Implements the same operation set as the Redis adapter on top of a single
//! map guarded by a read/write lock. Expired keys are hidden on read and
//! physically removed by a background sweep.

use crate::clock::Clock;
use crate::store::{ttl_millis, AtomicUpdate, PubSub, Store, StoreError, StoreResult, Write};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    /// Kept sorted by score, then member.
    Sorted(Vec<(i64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

pub struct InMemoryStore {
    data: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Removes every expired key. Returns how many were dropped.
    pub fn sweep_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now_millis();
        let mut data = self.data.write().map_err(|_| StoreError::LockPoisoned)?;

        let initial_count = data.len();
        data.retain(|_, entry| !entry.is_expired(now));

        Ok(initial_count - data.len())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.data
            .read()
            .map(|data| data.values().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> StoreResult<()> {
        let mut data = self.data.write().map_err(|_| StoreError::LockPoisoned)?;
        data.clear();
        Ok(())
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `interval` until
    /// `shutdown` flips or its sender goes away.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?interval, "Starting in-memory store expiry sweep");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep_expired() {
                            Ok(0) => {}
                            Ok(removed) => debug!(removed = removed, "Swept expired in-memory keys"),
                            Err(e) => tracing::error!(error = %e, "In-memory expiry sweep failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }

            info!("In-memory store expiry sweep stopped");
        })
    }

    fn read<T>(&self, key: &str, f: impl FnOnce(Option<&Value>) -> StoreResult<T>) -> StoreResult<T> {
        let now = self.clock.now_millis();
        let data = self.data.read().map_err(|_| StoreError::LockPoisoned)?;
        let value = data
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| &entry.value);
        f(value)
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, i64) -> StoreResult<T>) -> StoreResult<T> {
        let now = self.clock.now_millis();
        let mut data = self.data.write().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut data, now)
    }

    fn sorted_mut<'a>(
        data: &'a mut HashMap<String, Entry>,
        key: &str,
        now: i64,
    ) -> StoreResult<Option<&'a mut Vec<(i64, String)>>> {
        if data.get(key).is_some_and(|entry| entry.is_expired(now)) {
            data.remove(key);
        }

        match data.get_mut(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Sorted(members),
                ..
            }) => Ok(Some(members)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }
}

fn expiry_at(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(ttl_millis(ttl))
}

/// Translates a Redis glob into an anchored regex.
fn glob_to_regex(pattern: &str) -> StoreResult<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');

    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');

    Regex::new(&source).map_err(|e| StoreError::Pattern(e.to_string()))
}

#[async_trait]
impl Store for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.read(key, |value| match value {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(Value::Sorted(_)) => Err(StoreError::WrongType(key.to_string())),
        })
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.write(|data, now| {
            let expires_at = data
                .get(key)
                .filter(|entry| !entry.is_expired(now))
                .and_then(|entry| entry.expires_at);

            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(value.to_string()),
                    expires_at,
                },
            );
            Ok(())
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.write(|data, now| {
            if let Some(entry) = data.get_mut(key) {
                if !entry.is_expired(now) {
                    entry.expires_at = Some(expiry_at(now, ttl));
                }
            }
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.write(|data, _| {
            data.remove(key);
            Ok(())
        })
    }

    async fn update(&self, key: &str, update: &AtomicUpdate<'_>) -> StoreResult<Vec<i64>> {
        // Read, transition and write all happen under one write lock.
        self.write(|data, now| {
            if data.get(key).is_some_and(|entry| entry.is_expired(now)) {
                data.remove(key);
            }

            let current = match data.get(key) {
                None => None,
                Some(Entry {
                    value: Value::Text(text),
                    ..
                }) => Some(text.as_str()),
                Some(_) => return Err(StoreError::WrongType(key.to_string())),
            };

            let (write, reply) = (update.apply)(current)?;
            match write {
                Write::Keep => {}
                Write::Put { value, ttl } => {
                    data.insert(
                        key.to_string(),
                        Entry {
                            value: Value::Text(value),
                            expires_at: Some(expiry_at(now, ttl)),
                        },
                    );
                }
                Write::Delete => {
                    data.remove(key);
                }
            }

            Ok(reply)
        })
    }

    async fn keys_matching(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        let now = self.clock.now_millis();
        let data = self.data.read().map_err(|_| StoreError::LockPoisoned)?;

        let mut keys: Vec<String> = data
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && matcher.is_match(key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();

        Ok(keys)
    }

    async fn z_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        self.write(|data, now| {
            if data.get(key).is_some_and(|entry| entry.is_expired(now)) {
                data.remove(key);
            }

            let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Sorted(Vec::new()),
                expires_at: None,
            });
            let members = match &mut entry.value {
                Value::Sorted(members) => members,
                Value::Text(_) => return Err(StoreError::WrongType(key.to_string())),
            };

            members.retain(|(_, existing)| existing != member);
            let item = (score, member.to_string());
            let position = members.partition_point(|existing| *existing < item);
            members.insert(position, item);
            Ok(())
        })
    }

    async fn z_count(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.read(key, |value| match value {
            None => Ok(0),
            Some(Value::Sorted(members)) => Ok(members
                .iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .count() as u64),
            Some(Value::Text(_)) => Err(StoreError::WrongType(key.to_string())),
        })
    }

    async fn z_remove_range(&self, key: &str, min: i64, max: i64) -> StoreResult<()> {
        self.write(|data, now| {
            let emptied = match Self::sorted_mut(data, key, now)? {
                Some(members) => {
                    members.retain(|(score, _)| *score < min || *score > max);
                    members.is_empty()
                }
                None => false,
            };

            // Redis drops a sorted set once its last member goes.
            if emptied {
                data.remove(key);
            }
            Ok(())
        })
    }

    async fn z_trim_and_count(&self, key: &str, window_start: i64, now: i64) -> StoreResult<u64> {
        // One write lock for both steps so concurrent callers see no torn state.
        self.write(|data, clock_now| {
            let (count, emptied) = match Self::sorted_mut(data, key, clock_now)? {
                Some(members) => {
                    members.retain(|(score, _)| *score >= window_start);
                    let count = members.iter().filter(|(score, _)| *score <= now).count();
                    (count as u64, members.is_empty())
                }
                None => (0, false),
            };

            if emptied {
                data.remove(key);
            }
            Ok(count)
        })
    }
}

/// Process-local pub/sub over a broadcast channel per topic.
pub struct InMemoryPubSub {
    topics: RwLock<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: 64,
        }
    }

    fn sender(&self, topic: &str) -> StoreResult<broadcast::Sender<String>> {
        if let Some(sender) = self
            .topics
            .read()
            .map_err(|_| StoreError::LockPoisoned)?
            .get(topic)
        {
            return Ok(sender.clone());
        }

        let mut topics = self.topics.write().map_err(|_| StoreError::LockPoisoned)?;
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.clone())
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, topic: &str, message: &str) -> StoreResult<()> {
        // No subscribers is not an error, same as Redis.
        let _ = self.sender(topic)?.send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> StoreResult<BoxStream<'static, String>> {
        let receiver = self.sender(topic)?.subscribe();

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(message) => Some((message, receiver)),
                // A lagging subscriber still needs to know something changed.
                Err(broadcast::error::RecvError::Lagged(_)) => Some((String::new(), receiver)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(stream.boxed())
    }
}
