use crate::algorithms::{
    FixedWindowLimiter, RateLimitAlgorithm, RateLimitDecision, SlidingWindowLimiter,
    TokenBucketLimiter,
};
use crate::clock::Clock;
use crate::error::LimitError;
use crate::notification::ErrorNotifier;
use crate::rate_limit_config::Strategy;
use crate::rules::RuleCache;
use crate::store::Store;
use std::sync::Arc;
use tracing::{error, warn};

/// Admission control entry point.
///
/// Resolves the endpoint's rule from the cache, runs the matching strategy
/// and applies the rule's error policy. Always produces a decision.
pub struct Throttler {
    rules: Arc<RuleCache>,
    token_bucket: Arc<TokenBucketLimiter>,
    fixed_window: FixedWindowLimiter,
    sliding_window: SlidingWindowLimiter,
    notifier: ErrorNotifier,
}

impl Throttler {
    pub fn new(
        store: Arc<dyn Store>,
        rules: Arc<RuleCache>,
        clock: Arc<dyn Clock>,
        notifier: ErrorNotifier,
    ) -> Self {
        Self {
            rules,
            token_bucket: Arc::new(TokenBucketLimiter::new(store.clone(), clock.clone())),
            fixed_window: FixedWindowLimiter::new(store.clone(), clock.clone()),
            sliding_window: SlidingWindowLimiter::new(store, clock),
            notifier,
        }
    }

    pub fn rules(&self) -> &Arc<RuleCache> {
        &self.rules
    }

    /// Token bucket limiter, shared with its refill job.
    pub fn token_bucket(&self) -> Arc<TokenBucketLimiter> {
        Arc::clone(&self.token_bucket)
    }

    pub async fn check_limit(&self, identity: &str, endpoint: &str) -> RateLimitDecision {
        let Some(rule) = self.rules.get(endpoint) else {
            return RateLimitDecision::unlimited();
        };

        let limiter: &dyn RateLimitAlgorithm = match &rule.strategy {
            Strategy::TokenBucket => self.token_bucket.as_ref(),
            Strategy::FixedWindow => &self.fixed_window,
            Strategy::SlidingWindow => &self.sliding_window,
            Strategy::Unknown(name) => {
                warn!(endpoint = %endpoint, strategy = %name, "Unknown strategy, not limiting");
                return RateLimitDecision::unlimited();
            }
        };

        match limiter.process_request(identity, endpoint, &rule).await {
            Ok(decision) => decision,
            Err(LimitError::Validation(msg)) => {
                warn!(identity = %identity, endpoint = %endpoint, error = %msg, "Rejected malformed rate limit request");
                RateLimitDecision::backend_error()
            }
            Err(LimitError::Store(e)) => {
                error!(
                    identity = %identity,
                    endpoint = %endpoint,
                    strategy = %rule.strategy,
                    error = %e,
                    "Rate limit store failure"
                );
                self.notifier
                    .report(&e.to_string(), identity, endpoint, &rule);

                if rule.allow_on_error {
                    RateLimitDecision::unlimited()
                } else {
                    RateLimitDecision::backend_error()
                }
            }
        }
    }
}
