//! Storage capabilities used by the limiting strategies and the rules layer.
//!
//! A [`Store`] is a keyed store with string values, per-key expiry and
//! score-ordered sets. It is implemented by the Redis adapter and by the
//! in-process fallback, so strategies never know which one they talk to.
//! [`PubSub`] is the invalidation channel capability.

use async_trait::async_trait;
use futures::stream::BoxStream;
use redis::Script;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a store backend. All of them are treated as transient.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("malformed stored payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("key {0} holds a value of the wrong type")]
    WrongType(String),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("invalid key pattern: {0}")]
    Pattern(String),

    #[error("unexpected reply from atomic update: {0:?}")]
    Reply(Vec<i64>),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Longest expiry ever handed to a backend.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// `ttl` in whole milliseconds, clamped to [`MAX_TTL`].
pub fn ttl_millis(ttl: Duration) -> i64 {
    ttl.min(MAX_TTL).as_millis() as i64
}

/// What an atomic update leaves behind under its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Keep,
    /// Replaces the value and resets its expiry.
    Put { value: String, ttl: Duration },
    Delete,
}

/// State transition over the current value of one key, returning what to
/// write and the integers to reply with.
pub type Transition<'a> = dyn Fn(Option<&str>) -> StoreResult<(Write, Vec<i64>)> + Send + Sync + 'a;

/// A read-modify-write on one key that concurrent callers cannot interleave.
///
/// Remote backends run `script` server side with `KEYS[1]` bound to the key
/// and `ARGV` to `args`. In-process backends call `apply` on the current value
/// while holding their write lock. Both must encode the same transition and
/// reply with the same integers.
pub struct AtomicUpdate<'a> {
    pub script: &'a Script,
    pub args: Vec<String>,
    pub apply: &'a Transition<'a>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes `value`, keeping any expiry already set on `key`.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Applies `update` to `key` atomically and returns its reply.
    async fn update(&self, key: &str, update: &AtomicUpdate<'_>) -> StoreResult<Vec<i64>>;

    /// Glob-style match (`*`, `?`) over live keys.
    async fn keys_matching(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn z_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()>;

    /// Number of members with `min <= score <= max`.
    async fn z_count(&self, key: &str, min: i64, max: i64) -> StoreResult<u64>;

    /// Removes members with `min <= score <= max`.
    async fn z_remove_range(&self, key: &str, min: i64, max: i64) -> StoreResult<()>;

    /// Drops every member scored below `window_start` and counts the members in
    /// `[window_start, now]`. Backends that can batch commands override this.
    async fn z_trim_and_count(&self, key: &str, window_start: i64, now: i64) -> StoreResult<u64> {
        self.z_remove_range(key, i64::MIN, window_start - 1).await?;
        self.z_count(key, window_start, now).await
    }

    /// Adds a member and refreshes the key's expiry.
    async fn z_add_with_expiry(
        &self,
        key: &str,
        score: i64,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.z_add(key, score, member).await?;
        self.expire(key, ttl).await
    }
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, message: &str) -> StoreResult<()>;

    /// Subscribes to `topic`. The stream ends when the subscription is lost.
    async fn subscribe(&self, topic: &str) -> StoreResult<BoxStream<'static, String>>;
}

/// Reads and decodes a JSON value stored under `key`.
pub async fn get_json<T: DeserializeOwned>(store: &dyn Store, key: &str) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encodes `value` as JSON and stores it under `key`, keeping its expiry.
pub async fn set_json<T: Serialize + Sync>(store: &dyn Store, key: &str, value: &T) -> StoreResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw).await
}
