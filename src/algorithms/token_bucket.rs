//! Token bucket rate limiting algorithm
//!
//! Requests only ever take tokens; a periodic refill sweep is the only writer
//! that puts them back. Buckets nobody refilled for `retention_time` are
//! dropped by the same sweep. Both paths are single atomic store updates, so
//! concurrent requests and the sweep never overwrite each other.

use super::{limiter_key, put_json, RateLimitAlgorithm, RateLimitDecision};
use crate::clock::Clock;
use crate::error::LimitError;
use crate::rate_limit_config::{Rule, TokenBucketRule};
use crate::store::{get_json, AtomicUpdate, Store, StoreError, StoreResult, Write};
use async_trait::async_trait;
use redis::Script;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const KEY_PREFIX: &str = "token_bucket";

/// ARGV[1]: bucket to start from when the key is absent.
const CONSUME_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local bucket = cjson.decode(raw or ARGV[1])
if bucket.available_tokens <= 0 then
    return {0, bucket.capacity, 0}
end
bucket.available_tokens = bucket.available_tokens - 1
redis.call('SET', KEYS[1], cjson.encode(bucket))
redis.call('PEXPIRE', KEYS[1], bucket.retention_time * 1000)
return {1, bucket.capacity, bucket.available_tokens}
"#;

/// ARGV[1]: now in unix ms. Replies with a [`BucketOutcome`] code.
const REFILL_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return {0}
end
local bucket = cjson.decode(raw)
local now = tonumber(ARGV[1])
if now - bucket.last_refill >= bucket.retention_time * 1000 then
    redis.call('DEL', KEYS[1])
    return {2}
end
local missing = bucket.capacity - bucket.available_tokens
if missing <= 0 then
    return {0}
end
bucket.available_tokens = bucket.available_tokens + math.min(bucket.token_add_rate, missing)
bucket.last_refill = now
redis.call('SET', KEYS[1], cjson.encode(bucket))
redis.call('PEXPIRE', KEYS[1], bucket.retention_time * 1000)
return {1}
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub identity: String,
    pub endpoint: String,
    pub capacity: i64,
    pub available_tokens: i64,
    pub token_add_rate: i64,
    /// Unix ms of the last refill that added tokens.
    pub last_refill: i64,
    /// Seconds.
    pub retention_time: i64,
    pub created_at: i64,
}

impl Bucket {
    fn new(identity: &str, endpoint: &str, rule: &TokenBucketRule, now: i64) -> Self {
        Self {
            identity: identity.to_string(),
            endpoint: endpoint.to_string(),
            capacity: rule.capacity,
            available_tokens: rule.capacity,
            token_add_rate: rule.token_add_rate,
            last_refill: now,
            retention_time: rule.retention_time,
            created_at: now,
        }
    }

    fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_time.max(0) as u64)
    }

    fn is_idle(&self, now: i64) -> bool {
        now - self.last_refill >= self.retention_time.saturating_mul(1000)
    }

    /// Adds up to one refill's worth of tokens. Returns whether anything changed.
    fn refill(&mut self, now: i64) -> bool {
        let missing = self.capacity - self.available_tokens;
        if missing <= 0 {
            return false;
        }

        self.available_tokens += self.token_add_rate.min(missing);
        self.last_refill = now;
        true
    }

    /// Takes one token from the stored bucket, or from `fresh` when there is none.
    fn consume(current: Option<&str>, fresh: &Bucket) -> StoreResult<(Write, Vec<i64>)> {
        let mut bucket: Bucket = match current {
            Some(raw) => serde_json::from_str(raw)?,
            None => fresh.clone(),
        };

        if bucket.available_tokens <= 0 {
            let decision = RateLimitDecision::limit_exceeded(bucket.capacity);
            return Ok((Write::Keep, decision.into_reply()));
        }

        bucket.available_tokens -= 1;
        let decision = RateLimitDecision::allowed(bucket.capacity, bucket.available_tokens);
        Ok((put_json(&bucket, bucket.retention())?, decision.into_reply()))
    }

    fn sweep(current: Option<&str>, now: i64) -> StoreResult<(Write, Vec<i64>)> {
        let Some(raw) = current else {
            return Ok((Write::Keep, vec![BucketOutcome::Untouched.code()]));
        };
        let mut bucket: Bucket = serde_json::from_str(raw)?;

        if bucket.is_idle(now) {
            return Ok((Write::Delete, vec![BucketOutcome::Removed.code()]));
        }
        if !bucket.refill(now) {
            return Ok((Write::Keep, vec![BucketOutcome::Untouched.code()]));
        }

        Ok((
            put_json(&bucket, bucket.retention())?,
            vec![BucketOutcome::Refilled.code()],
        ))
    }
}

/// Outcome of one refill sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefillReport {
    pub refilled: usize,
    pub removed: usize,
    pub failed: usize,
}

pub struct TokenBucketLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    consume_script: Script,
    refill_script: Script,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            consume_script: Script::new(CONSUME_SCRIPT),
            refill_script: Script::new(REFILL_SCRIPT),
        }
    }

    pub async fn get_bucket(&self, key: &str) -> StoreResult<Option<Bucket>> {
        get_json(self.store.as_ref(), key).await
    }

    /// One refill pass over every bucket in the store.
    ///
    /// Failures on a single bucket are logged and counted; they never stop
    /// the pass.
    pub async fn add_tokens(&self) -> StoreResult<RefillReport> {
        let keys = self
            .store
            .keys_matching(&format!("{}:*", KEY_PREFIX))
            .await?;
        let mut report = RefillReport::default();

        debug!(buckets = keys.len(), "Refilling token buckets");

        for key in keys {
            match self.refill_bucket(&key).await {
                Ok(BucketOutcome::Refilled) => report.refilled += 1,
                Ok(BucketOutcome::Removed) => {
                    report.removed += 1;
                    debug!(key = %key, "Removed idle token bucket");
                }
                Ok(BucketOutcome::Untouched) => {}
                Err(e) => {
                    report.failed += 1;
                    error!(key = %key, error = %e, "Failed to refill token bucket");
                }
            }
        }

        Ok(report)
    }

    async fn refill_bucket(&self, key: &str) -> StoreResult<BucketOutcome> {
        let now = self.clock.now_millis();
        let apply = move |current: Option<&str>| Bucket::sweep(current, now);

        let reply = self
            .store
            .update(
                key,
                &AtomicUpdate {
                    script: &self.refill_script,
                    args: vec![now.to_string()],
                    apply: &apply,
                },
            )
            .await?;

        BucketOutcome::from_reply(reply)
    }

    /// Runs [`add_tokens`](Self::add_tokens) every `interval` until `shutdown`
    /// flips or its sender goes away.
    pub fn spawn_refill(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; buckets were just created.
            ticker.tick().await;
            info!(interval = ?interval, "Starting token bucket refill job");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.add_tokens().await {
                            Ok(report) => debug!(
                                refilled = report.refilled,
                                removed = report.removed,
                                failed = report.failed,
                                "Token bucket refill complete"
                            ),
                            Err(e) => warn!(error = %e, "Unable to list token buckets for refill"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }

            info!("Token bucket refill job stopped");
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BucketOutcome {
    Untouched,
    Refilled,
    Removed,
}

impl BucketOutcome {
    fn code(self) -> i64 {
        match self {
            BucketOutcome::Untouched => 0,
            BucketOutcome::Refilled => 1,
            BucketOutcome::Removed => 2,
        }
    }

    fn from_reply(reply: Vec<i64>) -> StoreResult<Self> {
        match reply.as_slice() {
            [0] => Ok(BucketOutcome::Untouched),
            [1] => Ok(BucketOutcome::Refilled),
            [2] => Ok(BucketOutcome::Removed),
            _ => Err(StoreError::Reply(reply)),
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketLimiter {
    async fn process_request(
        &self,
        identity: &str,
        endpoint: &str,
        rule: &Rule,
    ) -> Result<RateLimitDecision, LimitError> {
        let key = limiter_key(KEY_PREFIX, identity, endpoint)?;
        let params = rule.token_bucket.as_ref().ok_or_else(|| {
            LimitError::Validation(format!("rule for {} has no token bucket settings", endpoint))
        })?;

        let fresh = Bucket::new(identity, endpoint, params, self.clock.now_millis());
        let fresh_json = serde_json::to_string(&fresh).map_err(StoreError::from)?;
        let apply = |current: Option<&str>| Bucket::consume(current, &fresh);

        let reply = self
            .store
            .update(
                &key,
                &AtomicUpdate {
                    script: &self.consume_script,
                    args: vec![fresh_json],
                    apply: &apply,
                },
            )
            .await?;

        Ok(RateLimitDecision::from_reply(reply)?)
    }
}
