//! Sliding window rate limiting algorithm
//!
//! Keeps a log of request timestamps per key in a sorted set and counts the
//! entries inside `[now - window, now]`. Trimming and counting go out as one
//! batch, and so do recording and the expiry refresh.

use super::{limiter_key, RateLimitAlgorithm, RateLimitDecision};
use crate::clock::Clock;
use crate::error::LimitError;
use crate::rate_limit_config::Rule;
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub const KEY_PREFIX: &str = "sliding_window";

/// Sliding window rate limiter implementation
pub struct SlidingWindowLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Unique per request so two hits in the same millisecond both count.
    fn member(now: i64) -> String {
        format!("{}-{}", now, Uuid::new_v4())
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowLimiter {
    async fn process_request(
        &self,
        identity: &str,
        endpoint: &str,
        rule: &Rule,
    ) -> Result<RateLimitDecision, LimitError> {
        let key = limiter_key(KEY_PREFIX, identity, endpoint)?;
        let params = rule.sliding_window.as_ref().ok_or_else(|| {
            LimitError::Validation(format!("rule for {} has no sliding window settings", endpoint))
        })?;

        let now = self.clock.now_millis();
        let window_start = now - params.window_millis();

        let count = self.store.z_trim_and_count(&key, window_start, now).await? as i64;

        if count >= params.max_requests {
            return Ok(RateLimitDecision::limit_exceeded(params.max_requests));
        }

        self.store
            .z_add_with_expiry(&key, now, &Self::member(now), params.window_duration())
            .await?;

        Ok(RateLimitDecision::allowed(
            params.max_requests,
            params.max_requests - (count + 1),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::DecisionStatus;
    use crate::clock::ManualClock;
    use crate::memory_store::InMemoryStore;
    use std::time::Duration;

    fn setup() -> (SlidingWindowLimiter, Arc<InMemoryStore>, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(InMemoryStore::new(Arc::new(clock.clone())));
        let limiter = SlidingWindowLimiter::new(store.clone(), Arc::new(clock.clone()));
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_exactly_max_requests_per_window() {
        let (limiter, _, _) = setup();
        let rule = Rule::sliding_window("/x", 3, 10);

        for expected in [2, 1, 0] {
            let decision = limiter.process_request("c", "/x", &rule).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let decision = limiter.process_request("c", "/x", &rule).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::LimitExceeded);
        assert_eq!(decision.limit, 3);
    }

    #[tokio::test]
    async fn test_same_millisecond_requests_all_count() {
        let (limiter, store, _) = setup();
        let rule = Rule::sliding_window("/x", 10, 10);

        for _ in 0..4 {
            limiter.process_request("c", "/x", &rule).await.unwrap();
        }

        let count = store
            .z_count("sliding_window:c:/x", i64::MIN, i64::MAX)
            .await
            .unwrap();
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_old_entries_slide_out() {
        let (limiter, store, clock) = setup();
        let rule = Rule::sliding_window("/x", 2, 10);

        limiter.process_request("c", "/x", &rule).await.unwrap();
        clock.advance(Duration::from_secs(6));
        limiter.process_request("c", "/x", &rule).await.unwrap();
        assert!(!limiter.process_request("c", "/x", &rule).await.unwrap().allowed);

        // First entry leaves the window; second is still inside.
        clock.advance(Duration::from_millis(4_001));
        let decision = limiter.process_request("c", "/x", &rule).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);

        let count = store
            .z_count("sliding_window:c:/x", i64::MIN, i64::MAX)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_rejected_request_is_not_recorded() {
        let (limiter, store, _) = setup();
        let rule = Rule::sliding_window("/x", 1, 10);

        limiter.process_request("c", "/x", &rule).await.unwrap();
        for _ in 0..5 {
            limiter.process_request("c", "/x", &rule).await.unwrap();
        }

        let count = store
            .z_count("sliding_window:c:/x", i64::MIN, i64::MAX)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
