use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

use crate::error::Error;

const DEFAULT_RETENTION_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule: {0}")]
    Invalid(String),

    #[error("no rule for endpoint {0}")]
    NotFound(String),
}

/// Limiting strategy a rule selects.
///
/// Deserializes from the canonical names and from the legacy spaced
/// spellings. Anything else is kept as `Unknown` and rejected by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Strategy {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
    Unknown(String),
}

impl Strategy {
    pub fn as_str(&self) -> &str {
        match self {
            Strategy::TokenBucket => "TOKEN_BUCKET",
            Strategy::FixedWindow => "FIXED_WINDOW",
            Strategy::SlidingWindow => "SLIDING_WINDOW",
            Strategy::Unknown(raw) => raw,
        }
    }
}

impl From<String> for Strategy {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TOKEN_BUCKET" | "TOKEN BUCKET" => Strategy::TokenBucket,
            "FIXED_WINDOW" | "FIXED WINDOW COUNTER" | "FIXED_WINDOW_COUNTER" => Strategy::FixedWindow,
            "SLIDING_WINDOW" | "SLIDING WINDOW COUNTER" | "SLIDING_WINDOW_COUNTER" => {
                Strategy::SlidingWindow
            }
            _ => Strategy::Unknown(raw),
        }
    }
}

impl From<Strategy> for String {
    fn from(strategy: Strategy) -> Self {
        strategy.as_str().to_string()
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_retention_time() -> i64 {
    DEFAULT_RETENTION_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TokenBucketRule {
    #[serde(alias = "bucket_capacity")]
    #[validate(range(min = 1, message = "capacity must be positive"))]
    pub capacity: i64,

    #[validate(range(min = 1, message = "token_add_rate must be positive"))]
    pub token_add_rate: i64,

    /// Seconds an untouched bucket is kept before the refill sweep drops it.
    #[serde(default = "default_retention_time")]
    #[validate(range(
        min = 1,
        max = 315_360_000,
        message = "retention_time must be between 1 second and 10 years"
    ))]
    pub retention_time: i64,
}

/// Shared shape of the fixed and sliding window sub-rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct WindowRule {
    #[validate(range(min = 1, message = "max_requests must be positive"))]
    pub max_requests: i64,

    /// Window length in seconds.
    #[serde(alias = "window_size")]
    #[validate(range(
        min = 1,
        max = 315_360_000,
        message = "window must be between 1 second and 10 years"
    ))]
    pub window: i64,
}

impl WindowRule {
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window.max(0) as u64)
    }

    pub fn window_millis(&self) -> i64 {
        self.window.saturating_mul(1000)
    }
}

/// Rate limiting rule for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_sub_rule"))]
pub struct Rule {
    pub strategy: Strategy,

    #[validate(length(min = 1, message = "endpoint must not be empty"))]
    pub endpoint: String,

    #[serde(default)]
    pub http_method: String,

    #[serde(default)]
    pub allow_on_error: bool,

    #[serde(default, alias = "token_bucket_rule", skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub token_bucket: Option<TokenBucketRule>,

    #[serde(
        default,
        alias = "fixed_window_counter_rule",
        skip_serializing_if = "Option::is_none"
    )]
    #[validate(nested)]
    pub fixed_window: Option<WindowRule>,

    #[serde(
        default,
        alias = "sliding_window_counter_rule",
        skip_serializing_if = "Option::is_none"
    )]
    #[validate(nested)]
    pub sliding_window: Option<WindowRule>,
}

fn validate_sub_rule(rule: &Rule) -> Result<(), ValidationError> {
    let present = match rule.strategy {
        Strategy::TokenBucket => rule.token_bucket.is_some(),
        Strategy::FixedWindow => rule.fixed_window.is_some(),
        Strategy::SlidingWindow => rule.sliding_window.is_some(),
        Strategy::Unknown(_) => {
            return Err(ValidationError::new("unsupported_strategy")
                .with_message(format!("unsupported strategy {}", rule.strategy).into()));
        }
    };

    if !present {
        return Err(ValidationError::new("missing_sub_rule")
            .with_message(format!("{} rule requires its sub-rule", rule.strategy).into()));
    }

    Ok(())
}

impl Rule {
    pub fn token_bucket(endpoint: &str, capacity: i64, token_add_rate: i64, retention_time: i64) -> Self {
        Self {
            token_bucket: Some(TokenBucketRule {
                capacity,
                token_add_rate,
                retention_time,
            }),
            ..Self::bare(Strategy::TokenBucket, endpoint)
        }
    }

    pub fn fixed_window(endpoint: &str, max_requests: i64, window: i64) -> Self {
        Self {
            fixed_window: Some(WindowRule { max_requests, window }),
            ..Self::bare(Strategy::FixedWindow, endpoint)
        }
    }

    pub fn sliding_window(endpoint: &str, max_requests: i64, window: i64) -> Self {
        Self {
            sliding_window: Some(WindowRule { max_requests, window }),
            ..Self::bare(Strategy::SlidingWindow, endpoint)
        }
    }

    pub fn with_allow_on_error(mut self, allow_on_error: bool) -> Self {
        self.allow_on_error = allow_on_error;
        self
    }

    fn bare(strategy: Strategy, endpoint: &str) -> Self {
        Self {
            strategy,
            endpoint: endpoint.to_string(),
            http_method: String::new(),
            allow_on_error: false,
            token_bucket: None,
            fixed_window: None,
            sliding_window: None,
        }
    }

    /// Validates the rule, flattening field errors into a [`RuleError`].
    pub fn check(&self) -> Result<(), RuleError> {
        self.validate()
            .map_err(|e| RuleError::Invalid(format!("{}: {}", self.endpoint, e)))
    }
}

/// On-disk rules document: `{ "rules": [ ... ] }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RulesFile {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        serde_json::from_str(raw).map_err(|e| Error::Config(format!("malformed rules file: {}", e)))
    }

    /// Reads a rules file. Unreadable or unparsable files are a configuration
    /// error; individual invalid rules are not.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read rules file {}: {}", path.display(), e))
        })?;

        Self::parse(&raw)
    }

    /// Valid rules keyed by endpoint. Invalid entries are skipped with a
    /// warning; a later entry for the same endpoint replaces an earlier one.
    pub fn valid_rules(self) -> Vec<Rule> {
        let mut by_endpoint = BTreeMap::new();

        for (index, rule) in self.rules.into_iter().enumerate() {
            if let Err(e) = rule.check() {
                tracing::warn!(index = index, error = %e, "Skipping invalid rule in rules file");
                continue;
            }
            by_endpoint.insert(rule.endpoint.clone(), rule);
        }

        by_endpoint.into_values().collect()
    }
}
