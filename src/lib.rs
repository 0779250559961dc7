pub mod algorithms;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod memory_store;
pub mod middleware;
pub mod notification;
pub mod rate_limit_config;
pub mod redis;
pub mod resilient;
pub mod rules;
pub mod server;
pub mod store;
pub mod throttler;

pub use algorithms::{DecisionStatus, RateLimitDecision};
pub use config::Config;
pub use error::{Error, Result};
pub use rate_limit_config::{Rule, Strategy};
pub use server::create_app;
pub use throttler::Throttler;
