//! Rate limiting algorithms module
//!
//! Each strategy evaluates one request against a [`Rule`] and answers with a
//! [`RateLimitDecision`]. Strategies keep all their state in a [`Store`], so
//! several service instances sharing one store enforce the same limits.
//!
//! [`Store`]: crate::store::Store

pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

use crate::error::LimitError;
use crate::rate_limit_config::Rule;
use crate::store::{StoreError, StoreResult, Write};
use async_trait::async_trait;
use serde::Serialize;

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

/// Outcome class of a decision, carried as its HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u16")]
pub enum DecisionStatus {
    Allowed,
    LimitExceeded,
    BackendError,
}

impl DecisionStatus {
    pub fn code(self) -> u16 {
        match self {
            DecisionStatus::Allowed => 200,
            DecisionStatus::LimitExceeded => 429,
            DecisionStatus::BackendError => 500,
        }
    }
}

impl From<DecisionStatus> for u16 {
    fn from(status: DecisionStatus) -> Self {
        status.code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub limit: i64,
    pub remaining: i64,
    pub allowed: bool,
    pub status: DecisionStatus,
}

impl RateLimitDecision {
    pub fn allowed(limit: i64, remaining: i64) -> Self {
        Self {
            limit,
            remaining,
            allowed: true,
            status: DecisionStatus::Allowed,
        }
    }

    pub fn limit_exceeded(limit: i64) -> Self {
        Self {
            limit,
            remaining: 0,
            allowed: false,
            status: DecisionStatus::LimitExceeded,
        }
    }

    pub fn backend_error() -> Self {
        Self {
            limit: 0,
            remaining: 0,
            allowed: false,
            status: DecisionStatus::BackendError,
        }
    }

    /// Decision for a request no rule applies to.
    pub fn unlimited() -> Self {
        Self::allowed(0, 0)
    }

    /// Reply of an admission update: `[allowed, limit, remaining]`.
    fn into_reply(self) -> Vec<i64> {
        vec![i64::from(self.allowed), self.limit, self.remaining]
    }

    fn from_reply(reply: Vec<i64>) -> StoreResult<Self> {
        match reply.as_slice() {
            [1, limit, remaining] => Ok(Self::allowed(*limit, *remaining)),
            [0, limit, _] => Ok(Self::limit_exceeded(*limit)),
            _ => Err(StoreError::Reply(reply)),
        }
    }
}

/// Serializes `state` for a [`Write::Put`] with `ttl`.
fn put_json<T: Serialize>(state: &T, ttl: std::time::Duration) -> StoreResult<Write> {
    Ok(Write::Put {
        value: serde_json::to_string(state)?,
        ttl,
    })
}

/// A limiting strategy.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    /// Evaluates one request by `identity` against `endpoint`'s rule.
    async fn process_request(
        &self,
        identity: &str,
        endpoint: &str,
        rule: &Rule,
    ) -> Result<RateLimitDecision, LimitError>;
}

/// Builds `{prefix}:{identity}:{endpoint}`, rejecting empty parts.
pub fn limiter_key(prefix: &str, identity: &str, endpoint: &str) -> Result<String, LimitError> {
    if identity.trim().is_empty() {
        return Err(LimitError::Validation("identity must not be empty".to_string()));
    }
    if endpoint.trim().is_empty() {
        return Err(LimitError::Validation("endpoint must not be empty".to_string()));
    }

    Ok(format!("{}:{}:{}", prefix, identity, endpoint))
}
