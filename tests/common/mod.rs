#![allow(dead_code)]

use async_trait::async_trait;
use gatekeeper::clock::{Clock, ManualClock};
use gatekeeper::handlers::AppState;
use gatekeeper::memory_store::{InMemoryPubSub, InMemoryStore};
use gatekeeper::notification::{ErrorNotifier, LogNotifier};
use gatekeeper::resilient::ResilientStore;
use gatekeeper::rules::{RuleCache, RuleStore, StoreRuleRepository};
use gatekeeper::store::{AtomicUpdate, Store, StoreError, StoreResult};
use gatekeeper::Throttler;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const START_MILLIS: i64 = 1_700_000_000_000;

/// Stand-in for an unreliable shared store: an in-memory store that fails
/// every call while `down` is set.
pub struct FlakyStore {
    inner: InMemoryStore,
    down: AtomicBool,
    pub calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: InMemoryStore::new(clock),
            down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    fn check(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout {
                op: "flaky",
                timeout: Duration::from_millis(500),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
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

/// Fully wired service over in-process stores.
pub struct Harness {
    pub clock: ManualClock,
    pub primary: Arc<FlakyStore>,
    pub fallback: Arc<InMemoryStore>,
    pub limiter_store: Arc<ResilientStore>,
    pub rules_store: Arc<InMemoryStore>,
    pub pubsub: Arc<InMemoryPubSub>,
    pub rules: Arc<StoreRuleRepository>,
    pub cache: Arc<RuleCache>,
    pub throttler: Arc<Throttler>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = ManualClock::new(START_MILLIS);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());

        let primary = Arc::new(FlakyStore::new(shared.clone()));
        let fallback = Arc::new(InMemoryStore::new(shared.clone()));
        let limiter_store = Arc::new(ResilientStore::new(primary.clone(), fallback.clone()));

        let rules_store = Arc::new(InMemoryStore::new(shared.clone()));
        let pubsub = Arc::new(InMemoryPubSub::new());
        let rules = Arc::new(StoreRuleRepository::new(rules_store.clone(), pubsub.clone()));
        let cache = Arc::new(RuleCache::new(rules.clone()));

        let notifier = ErrorNotifier::new(Arc::new(LogNotifier), shared.clone(), Duration::from_secs(30));
        let throttler = Arc::new(Throttler::new(
            limiter_store.clone(),
            cache.clone(),
            shared,
            notifier,
        ));

        Self {
            clock,
            primary,
            fallback,
            limiter_store,
            rules_store,
            pubsub,
            rules,
            cache,
            throttler,
        }
    }

    pub fn state(&self) -> AppState {
        let rules: Arc<dyn RuleStore> = self.rules.clone();
        AppState {
            throttler: self.throttler.clone(),
            rules,
            limiter_store: self.limiter_store.clone(),
            started_at: Instant::now(),
        }
    }
}
