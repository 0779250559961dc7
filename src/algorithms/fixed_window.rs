//! Fixed window counter.
//!
//! The window is measured from the last request that was served, not from a
//! calendar boundary: a steady stream of allowed requests keeps extending it.
//! Each hit is one atomic store update.

use super::{limiter_key, put_json, RateLimitAlgorithm, RateLimitDecision};
use crate::clock::Clock;
use crate::error::LimitError;
use crate::rate_limit_config::{Rule, WindowRule};
use crate::store::{get_json, AtomicUpdate, Store, StoreError, StoreResult, Write};
use async_trait::async_trait;
use redis::Script;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const KEY_PREFIX: &str = "fixed_window";

/// ARGV: counter to start from, now (ms), window (ms), max_requests, window (s).
const HIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3])
local raw = redis.call('GET', KEYS[1])
local counter
if raw then
    counter = cjson.decode(raw)
    counter.max_requests = tonumber(ARGV[4])
    counter.window = tonumber(ARGV[5])
    if now - counter.last_access < window_ms then
        if counter.current_requests >= counter.max_requests then
            return {0, counter.max_requests, 0}
        end
        counter.current_requests = counter.current_requests + 1
    else
        counter.current_requests = 1
    end
    counter.last_access = now
else
    counter = cjson.decode(ARGV[1])
end
redis.call('SET', KEYS[1], cjson.encode(counter))
redis.call('PEXPIRE', KEYS[1], window_ms)
return {1, counter.max_requests, counter.max_requests - counter.current_requests}
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindowCounter {
    pub identity: String,
    pub endpoint: String,
    pub max_requests: i64,
    pub current_requests: i64,
    /// Seconds.
    pub window: i64,
    /// Unix ms.
    pub last_access: i64,
    pub created_at: i64,
}

impl FixedWindowCounter {
    fn new(identity: &str, endpoint: &str, params: &WindowRule, now: i64) -> Self {
        Self {
            identity: identity.to_string(),
            endpoint: endpoint.to_string(),
            max_requests: params.max_requests,
            current_requests: 1,
            window: params.window,
            last_access: now,
            created_at: now,
        }
    }

    /// Counts one request against the stored counter, or starts `fresh`.
    fn hit(
        current: Option<&str>,
        fresh: &FixedWindowCounter,
        params: &WindowRule,
        now: i64,
    ) -> StoreResult<(Write, Vec<i64>)> {
        let counter = match current {
            None => fresh.clone(),
            Some(raw) => {
                let mut counter: FixedWindowCounter = serde_json::from_str(raw)?;

                // Rule changes take effect on the next request.
                counter.max_requests = params.max_requests;
                counter.window = params.window;

                if now - counter.last_access < params.window_millis() {
                    if counter.current_requests >= counter.max_requests {
                        let decision = RateLimitDecision::limit_exceeded(counter.max_requests);
                        return Ok((Write::Keep, decision.into_reply()));
                    }
                    counter.current_requests += 1;
                } else {
                    counter.current_requests = 1;
                }
                counter.last_access = now;
                counter
            }
        };

        let decision = RateLimitDecision::allowed(
            counter.max_requests,
            counter.max_requests - counter.current_requests,
        );
        Ok((put_json(&counter, params.window_duration())?, decision.into_reply()))
    }
}

pub struct FixedWindowLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    hit_script: Script,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            hit_script: Script::new(HIT_SCRIPT),
        }
    }

    pub async fn get_counter(&self, key: &str) -> StoreResult<Option<FixedWindowCounter>> {
        get_json(self.store.as_ref(), key).await
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowLimiter {
    async fn process_request(
        &self,
        identity: &str,
        endpoint: &str,
        rule: &Rule,
    ) -> Result<RateLimitDecision, LimitError> {
        let key = limiter_key(KEY_PREFIX, identity, endpoint)?;
        let params = rule.fixed_window.as_ref().ok_or_else(|| {
            LimitError::Validation(format!("rule for {} has no fixed window settings", endpoint))
        })?;

        let now = self.clock.now_millis();
        let fresh = FixedWindowCounter::new(identity, endpoint, params, now);
        let args = vec![
            serde_json::to_string(&fresh).map_err(StoreError::from)?,
            now.to_string(),
            params.window_millis().to_string(),
            params.max_requests.to_string(),
            params.window.to_string(),
        ];
        let apply = |current: Option<&str>| FixedWindowCounter::hit(current, &fresh, params, now);

        let reply = self
            .store
            .update(
                &key,
                &AtomicUpdate {
                    script: &self.hit_script,
                    args,
                    apply: &apply,
                },
            )
            .await?;

        Ok(RateLimitDecision::from_reply(reply)?)
    }
}
