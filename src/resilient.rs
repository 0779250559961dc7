//! Store wrapper that fails over from the shared store to the in-process one.
//!
//! The wrapper starts `Healthy` and routes every call to the primary. The
//! first primary error flips it to `Degraded` and the same call is answered by
//! the fallback. While degraded, calls skip the primary entirely. Only
//! [`ResilientStore::restore`], driven by the health monitor, flips it back.

use crate::store::{AtomicUpdate, Store, StoreResult};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const DEFAULT_WARNING_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Healthy,
    Degraded,
}

#[derive(Debug)]
struct State {
    liveness: Liveness,
    last_warning: Instant,
}

pub struct ResilientStore {
    primary: Arc<dyn Store>,
    fallback: Arc<dyn Store>,
    state: Mutex<State>,
    warning_interval: Duration,
}

impl ResilientStore {
    pub fn new(primary: Arc<dyn Store>, fallback: Arc<dyn Store>) -> Self {
        Self {
            primary,
            fallback,
            state: Mutex::new(State {
                liveness: Liveness::Healthy,
                last_warning: Instant::now(),
            }),
            warning_interval: DEFAULT_WARNING_INTERVAL,
        }
    }

    /// How often the "still degraded" warning is repeated.
    pub fn with_warning_interval(mut self, interval: Duration) -> Self {
        self.warning_interval = interval;
        self
    }

    pub fn health(&self) -> Liveness {
        self.state
            .lock()
            .map(|state| state.liveness)
            .unwrap_or(Liveness::Degraded)
    }

    pub fn is_degraded(&self) -> bool {
        self.health() == Liveness::Degraded
    }

    /// Routes calls to the primary again. Returns `true` if the wrapper was
    /// degraded.
    pub fn restore(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };

        if state.liveness == Liveness::Healthy {
            return false;
        }

        state.liveness = Liveness::Healthy;
        info!(
            primary = self.primary.name(),
            "Primary store restored, leaving in-memory fallback"
        );
        true
    }

    fn degrade(&self, op: &'static str, error: &dyn std::fmt::Display) {
        // A poisoned lock leaves us on the fallback, which is what we want anyway.
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        if state.liveness == Liveness::Healthy {
            state.liveness = Liveness::Degraded;
            state.last_warning = Instant::now();
            warn!(
                op = op,
                error = %error,
                primary = self.primary.name(),
                fallback = self.fallback.name(),
                "Primary store unavailable, switching to in-memory fallback"
            );
        }
    }

    /// Returns whether the primary should serve the next call, emitting the
    /// periodic degraded warning along the way.
    fn use_primary(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };

        if state.liveness == Liveness::Healthy {
            return true;
        }

        if state.last_warning.elapsed() >= self.warning_interval {
            state.last_warning = Instant::now();
            warn!(
                fallback = self.fallback.name(),
                "Still serving rate limits from in-memory fallback"
            );
        }
        false
    }

    async fn route<'a, T, F, Fut>(&'a self, op: &'static str, call: F) -> StoreResult<T>
    where
        F: Fn(&'a dyn Store) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        if self.use_primary() {
            match call(self.primary.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(e) => self.degrade(op, &e),
            }
        }

        call(self.fallback.as_ref()).await
    }
}

#[async_trait]
impl Store for ResilientStore {
    fn name(&self) -> &'static str {
        "resilient"
    }

    /// Probes the primary only; never changes the routing state.
    async fn ping(&self) -> StoreResult<()> {
        self.primary.ping().await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.route("GET", |store| store.get(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.route("SET", |store| store.set(key, value)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.route("EXPIRE", |store| store.expire(key, ttl)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.route("DEL", |store| store.delete(key)).await
    }

    async fn update(&self, key: &str, update: &AtomicUpdate<'_>) -> StoreResult<Vec<i64>> {
        self.route("EVALSHA", |store| store.update(key, update)).await
    }

    async fn keys_matching(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.route("SCAN", |store| store.keys_matching(pattern)).await
    }

    async fn z_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        self.route("ZADD", |store| store.z_add(key, score, member))
            .await
    }

    async fn z_count(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        self.route("ZCOUNT", |store| store.z_count(key, min, max))
            .await
    }

    async fn z_remove_range(&self, key: &str, min: i64, max: i64) -> StoreResult<()> {
        self.route("ZREMRANGEBYSCORE", |store| store.z_remove_range(key, min, max))
            .await
    }

    async fn z_trim_and_count(&self, key: &str, window_start: i64, now: i64) -> StoreResult<u64> {
        self.route("ZREMRANGEBYSCORE+ZCOUNT", |store| {
            store.z_trim_and_count(key, window_start, now)
        })
        .await
    }

    async fn z_add_with_expiry(
        &self,
        key: &str,
        score: i64,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.route("ZADD+PEXPIRE", |store| {
            store.z_add_with_expiry(key, score, member, ttl)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory_store::InMemoryStore;
    use crate::store::{StoreError, Write};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory store that errors on demand.
    struct SwitchableStore {
        inner: InMemoryStore,
        down: AtomicBool,
    }

    impl SwitchableStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::new(Arc::new(ManualClock::new(0))),
                down: AtomicBool::new(false),
            }
        }

        fn check(&self) -> StoreResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Timeout {
                    op: "test",
                    timeout: Duration::from_millis(1),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Store for SwitchableStore {
        fn name(&self) -> &'static str {
            "switchable"
        }

        async fn ping(&self) -> StoreResult<()> {
            self.check()
        }

        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.check()?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
            self.check()?;
            self.inner.set(key, value).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
            self.check()?;
            self.inner.expire(key, ttl).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.check()?;
            self.inner.delete(key).await
        }

        async fn update(&self, key: &str, update: &AtomicUpdate<'_>) -> StoreResult<Vec<i64>> {
            self.check()?;
            self.inner.update(key, update).await
        }

        async fn keys_matching(&self, pattern: &str) -> StoreResult<Vec<String>> {
            self.check()?;
            self.inner.keys_matching(pattern).await
        }

        async fn z_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
            self.check()?;
            self.inner.z_add(key, score, member).await
        }

        async fn z_count(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
            self.check()?;
            self.inner.z_count(key, min, max).await
        }

        async fn z_remove_range(&self, key: &str, min: i64, max: i64) -> StoreResult<()> {
            self.check()?;
            self.inner.z_remove_range(key, min, max).await
        }
    }

    fn setup() -> (Arc<SwitchableStore>, Arc<InMemoryStore>, ResilientStore) {
        let primary = Arc::new(SwitchableStore::new());
        let fallback = Arc::new(InMemoryStore::new(Arc::new(ManualClock::new(0))));
        let wrapper = ResilientStore::new(primary.clone(), fallback.clone());
        (primary, fallback, wrapper)
    }

    #[tokio::test]
    async fn test_healthy_routes_to_primary() {
        let (primary, fallback, wrapper) = setup();

        wrapper.set("k", "v").await.unwrap();

        assert_eq!(primary.inner.get("k").await.unwrap(), Some("v".to_string()));
        assert!(fallback.is_empty());
        assert_eq!(wrapper.health(), Liveness::Healthy);
    }

    #[tokio::test]
    async fn test_primary_error_degrades_and_serves_from_fallback() {
        let (primary, fallback, wrapper) = setup();
        primary.down.store(true, Ordering::SeqCst);

        wrapper.set("k", "v").await.unwrap();

        assert!(wrapper.is_degraded());
        assert_eq!(fallback.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_stays_degraded_until_restored() {
        let (primary, fallback, wrapper) = setup();
        primary.down.store(true, Ordering::SeqCst);
        wrapper.set("k", "fallback").await.unwrap();

        // Primary recovers, but only restore() switches back.
        primary.down.store(false, Ordering::SeqCst);
        wrapper.set("k", "still-fallback").await.unwrap();
        assert_eq!(
            fallback.get("k").await.unwrap(),
            Some("still-fallback".to_string())
        );
        assert_eq!(primary.inner.get("k").await.unwrap(), None);

        assert!(wrapper.restore());
        assert!(!wrapper.restore());
        wrapper.set("k", "primary").await.unwrap();
        assert_eq!(primary.inner.get("k").await.unwrap(), Some("primary".to_string()));
    }

    #[tokio::test]
    async fn test_ping_probes_primary_without_changing_state() {
        let (primary, _, wrapper) = setup();
        primary.down.store(true, Ordering::SeqCst);

        assert!(wrapper.ping().await.is_err());
        assert_eq!(wrapper.health(), Liveness::Healthy);
    }

    #[tokio::test]
    async fn test_batched_sorted_set_calls_fail_over() {
        let (primary, fallback, wrapper) = setup();
        primary.down.store(true, Ordering::SeqCst);

        wrapper
            .z_add_with_expiry("log", 10, "10-a", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(wrapper.z_trim_and_count("log", 0, 20).await.unwrap(), 1);
        assert_eq!(fallback.z_count("log", 0, 20).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_atomic_update_fails_over() {
        let (primary, fallback, wrapper) = setup();
        primary.down.store(true, Ordering::SeqCst);

        let script = redis::Script::new("");
        let put = |_: Option<&str>| -> StoreResult<(Write, Vec<i64>)> {
            Ok((
                Write::Put {
                    value: "1".to_string(),
                    ttl: Duration::from_secs(60),
                },
                vec![1],
            ))
        };
        let update = AtomicUpdate {
            script: &script,
            args: Vec::new(),
            apply: &put,
        };

        assert_eq!(wrapper.update("k", &update).await.unwrap(), vec![1]);
        assert!(wrapper.is_degraded());
        assert_eq!(fallback.get("k").await.unwrap(), Some("1".to_string()));
    }
}
