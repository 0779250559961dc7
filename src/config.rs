use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Parser)]
#[command(name = "gatekeeper", version, about = "Distributed rate limiting service")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis holding rate limit counters
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Redis holding rules; defaults to REDIS_URL
    #[arg(long, env = "RULES_REDIS_URL")]
    pub rules_redis_url: Option<String>,

    /// Upper bound on every Redis call, in milliseconds
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 500)]
    pub store_timeout_ms: u64,

    #[arg(long, env = "HEALTH_CHECK_INTERVAL_SECS", default_value_t = 30)]
    pub health_check_interval_secs: u64,

    #[arg(long, env = "TOKEN_REFILL_INTERVAL_SECS", default_value_t = 60)]
    pub token_refill_interval_secs: u64,

    #[arg(long, env = "MEMORY_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub memory_sweep_interval_secs: u64,

    /// Minimum gap between failure notifications for one client and endpoint
    #[arg(long, env = "NOTIFICATION_COOLDOWN_SECS", default_value_t = 30)]
    pub notification_cooldown_secs: u64,

    /// JSON rules file loaded into the rules store at startup
    #[arg(long, env = "RULES_FILE")]
    pub rules_file: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from command line and environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config::try_parse().map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn rules_redis_url(&self) -> &str {
        self.rules_redis_url.as_deref().unwrap_or(&self.redis_url)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn token_refill_interval(&self) -> Duration {
        Duration::from_secs(self.token_refill_interval_secs)
    }

    pub fn memory_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.memory_sweep_interval_secs)
    }

    pub fn notification_cooldown(&self) -> Duration {
        Duration::from_secs(self.notification_cooldown_secs)
    }

    pub fn validate(&self) -> Result<()> {
        validate_redis_url(&self.redis_url)?;
        validate_redis_url(self.rules_redis_url())?;

        let intervals = [
            ("STORE_TIMEOUT_MS", self.store_timeout_ms),
            ("HEALTH_CHECK_INTERVAL_SECS", self.health_check_interval_secs),
            ("TOKEN_REFILL_INTERVAL_SECS", self.token_refill_interval_secs),
            ("MEMORY_SWEEP_INTERVAL_SECS", self.memory_sweep_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            rules_redis_url: None,
            store_timeout_ms: 500,
            health_check_interval_secs: 30,
            token_refill_interval_secs: 60,
            memory_sweep_interval_secs: 60,
            notification_cooldown_secs: 30,
            rules_file: None,
            log_level: "info".to_string(),
        }
    }
}

fn validate_redis_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(Error::Config("Redis URL cannot be empty".to_string()));
    }

    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(Error::Config(format!(
            "Redis URL must start with 'redis://' or 'rediss://', got '{}'",
            url
        )));
    }

    Ok(())
}
