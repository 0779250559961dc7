use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::resilient::{Liveness, ResilientStore};
use crate::rules::RuleCache;
use crate::store::Store;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically probes a store and reacts to it coming back.
///
/// With [`restores`](Self::restores) it returns a degraded
/// [`ResilientStore`] to its primary once a probe succeeds. With
/// [`refreshes`](Self::refreshes) it rebuilds the rule cache on every
/// unavailable-to-available transition.
pub struct HealthMonitor {
    name: &'static str,
    probe: Arc<dyn Store>,
    interval: Duration,
    ping_timeout: Duration,
    wrapper: Option<Arc<ResilientStore>>,
    cache: Option<Arc<RuleCache>>,
    available: AtomicBool,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn Store>, interval: Duration) -> Self {
        Self {
            name: "store",
            probe,
            interval,
            ping_timeout: PING_TIMEOUT,
            wrapper: None,
            cache: None,
            available: AtomicBool::new(true),
        }
    }

    /// Label used in log lines.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn restores(mut self, wrapper: Arc<ResilientStore>) -> Self {
        self.wrapper = Some(wrapper);
        self
    }

    pub fn refreshes(mut self, cache: Arc<RuleCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Outcome of the last probe.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Probes once and applies any recovery actions. Returns whether the
    /// probe succeeded.
    pub async fn check_once(&self) -> bool {
        let up = match tokio::time::timeout(self.ping_timeout, self.probe.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(monitor = self.name, error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                debug!(monitor = self.name, "Health probe timed out");
                false
            }
        };
        let was_up = self.available.swap(up, Ordering::SeqCst);

        if !up {
            if was_up {
                warn!(monitor = self.name, "Store unreachable, continuing with cached state");
            }
            return false;
        }

        if let Some(wrapper) = &self.wrapper {
            if wrapper.restore() {
                info!(monitor = self.name, "Store connection restored");
            }
        }

        if !was_up {
            info!(monitor = self.name, "Store reachable again");
            if let Some(cache) = &self.cache {
                match cache.cache_rules_locally().await {
                    Ok(count) => info!(monitor = self.name, rules = count, "Refreshed cached rules"),
                    Err(e) => warn!(monitor = self.name, error = %e, "Failed to refresh cached rules"),
                }
            }
        }

        true
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(monitor = self.name, interval = ?self.interval, "Starting health monitor");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_once().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }

            info!(monitor = self.name, "Health monitor stopped");
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub limiter_store: ServiceStatus,
    pub rules: RulesStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RulesStatus {
    pub cached_rules: usize,
}

impl HealthStatus {
    pub fn collect(limiter_store: &ResilientStore, rules: &RuleCache, started_at: Instant) -> Self {
        let store_status = match limiter_store.health() {
            Liveness::Healthy => ServiceStatus {
                status: "healthy".to_string(),
                error: None,
            },
            Liveness::Degraded => ServiceStatus {
                status: "degraded".to_string(),
                error: Some("Shared store unreachable, using in-memory fallback".to_string()),
            },
        };

        HealthStatus {
            // Degraded still serves decisions, so the service itself stays up.
            status: if store_status.error.is_none() { "healthy" } else { "degraded" }.to_string(),
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: started_at.elapsed().as_secs(),
            dependencies: DependencyStatus {
                limiter_store: store_status,
                rules: RulesStatus {
                    cached_rules: rules.len(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory_store::{InMemoryPubSub, InMemoryStore};
    use crate::rate_limit_config::Rule;
    use crate::rules::{RuleStore, StoreRuleRepository};
    use crate::store::{AtomicUpdate, StoreError, StoreResult};
    use async_trait::async_trait;

    /// Probe-only store whose reachability is toggled by the test.
    struct Probe {
        up: AtomicBool,
    }

    #[async_trait]
    impl Store for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }

        async fn ping(&self) -> StoreResult<()> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::LockPoisoned)
            }
        }

        async fn get(&self, _: &str) -> StoreResult<Option<String>> {
            Err(StoreError::LockPoisoned)
        }

        async fn set(&self, _: &str, _: &str) -> StoreResult<()> {
            Err(StoreError::LockPoisoned)
        }

        async fn expire(&self, _: &str, _: Duration) -> StoreResult<()> {
            Err(StoreError::LockPoisoned)
        }

        async fn delete(&self, _: &str) -> StoreResult<()> {
            Err(StoreError::LockPoisoned)
        }

        async fn update(&self, _: &str, _: &AtomicUpdate<'_>) -> StoreResult<Vec<i64>> {
            Err(StoreError::LockPoisoned)
        }

        async fn keys_matching(&self, _: &str) -> StoreResult<Vec<String>> {
            Err(StoreError::LockPoisoned)
        }

        async fn z_add(&self, _: &str, _: i64, _: &str) -> StoreResult<()> {
            Err(StoreError::LockPoisoned)
        }

        async fn z_count(&self, _: &str, _: i64, _: i64) -> StoreResult<u64> {
            Err(StoreError::LockPoisoned)
        }

        async fn z_remove_range(&self, _: &str, _: i64, _: i64) -> StoreResult<()> {
            Err(StoreError::LockPoisoned)
        }
    }

    fn memory() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore::new(Arc::new(ManualClock::new(0))))
    }

    #[tokio::test]
    async fn test_restores_degraded_wrapper() {
        let probe = Arc::new(Probe {
            up: AtomicBool::new(false),
        });
        let wrapper = Arc::new(ResilientStore::new(probe.clone(), memory()));
        let monitor = HealthMonitor::new(probe.clone(), Duration::from_secs(30))
            .restores(wrapper.clone());

        // Any live call against the down primary degrades the wrapper.
        wrapper.get("k").await.unwrap();
        assert!(wrapper.is_degraded());

        assert!(!monitor.check_once().await);
        assert!(wrapper.is_degraded());

        probe.up.store(true, Ordering::SeqCst);
        assert!(monitor.check_once().await);
        assert!(!wrapper.is_degraded());
    }

    #[tokio::test]
    async fn test_refreshes_rules_on_recovery() {
        let probe = Arc::new(Probe {
            up: AtomicBool::new(true),
        });
        let rules_store = memory();
        let repo = Arc::new(StoreRuleRepository::new(
            rules_store,
            Arc::new(InMemoryPubSub::new()),
        ));
        let cache = Arc::new(RuleCache::new(repo.clone()));
        let monitor = HealthMonitor::new(probe.clone(), Duration::from_secs(30))
            .refreshes(cache.clone());

        // Still available: no rebuild.
        assert!(monitor.check_once().await);
        assert_eq!(*cache.subscribe_refreshes().borrow(), 0);

        probe.up.store(false, Ordering::SeqCst);
        assert!(!monitor.check_once().await);
        assert!(!monitor.is_available());

        repo.set_rule(Rule::fixed_window("/x", 5, 10)).await.unwrap();
        probe.up.store(true, Ordering::SeqCst);
        assert!(monitor.check_once().await);
        assert!(cache.get("/x").is_some());
    }

    #[test]
    fn test_health_status_serialization() {
        let status = HealthStatus {
            status: "healthy".to_string(),
            timestamp: 1234567890,
            version: "1.0.0".to_string(),
            uptime_seconds: 3600,
            dependencies: DependencyStatus {
                limiter_store: ServiceStatus {
                    status: "healthy".to_string(),
                    error: None,
                },
                rules: RulesStatus { cached_rules: 2 },
            },
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("1234567890"));
        assert!(json.contains("\"cached_rules\":2"));
    }
}
