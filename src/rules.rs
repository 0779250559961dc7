//! Rule persistence, the in-process rule cache and its invalidation listener.

use crate::error::{Error, Result};
use crate::rate_limit_config::Rule;
use crate::store::{get_json, set_json, PubSub, Store, StoreError, StoreResult};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const RULES_UPDATE_TOPIC: &str = "rules-update";
pub const RULE_KEY_PREFIX: &str = "rule";

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

pub fn rule_key(endpoint: &str) -> String {
    format!("{}:{}", RULE_KEY_PREFIX, endpoint)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Set,
    Delete,
}

/// Message published on [`RULES_UPDATE_TOPIC`] after every rule mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub id: Uuid,
    pub endpoint: String,
    pub action: RuleAction,
}

impl RuleUpdate {
    pub fn new(endpoint: &str, action: RuleAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            action,
        }
    }
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn get_rule(&self, endpoint: &str) -> Result<Option<Rule>>;

    async fn get_all_rule_keys(&self) -> Result<Vec<String>>;

    /// Every stored rule that parses. Validation is left to the caller.
    async fn get_all_rules(&self) -> Result<Vec<Rule>>;

    /// Validates, persists and announces `rule`.
    async fn set_rule(&self, rule: Rule) -> Result<()>;

    async fn delete_rule(&self, endpoint: &str) -> Result<()>;
}

/// Rules kept as JSON under `rule:{endpoint}` in any [`Store`], with changes
/// announced over a [`PubSub`].
pub struct StoreRuleRepository {
    store: Arc<dyn Store>,
    pubsub: Arc<dyn PubSub>,
}

impl StoreRuleRepository {
    pub fn new(store: Arc<dyn Store>, pubsub: Arc<dyn PubSub>) -> Self {
        Self { store, pubsub }
    }

    async fn announce(&self, endpoint: &str, action: RuleAction) {
        let update = RuleUpdate::new(endpoint, action);
        let result = match serde_json::to_string(&update) {
            Ok(message) => self.pubsub.publish(RULES_UPDATE_TOPIC, &message).await,
            Err(e) => Err(e.into()),
        };

        // The change is already stored; peers pick it up on their next refresh.
        if let Err(e) = result {
            warn!(endpoint = %endpoint, error = %e, "Failed to publish rule update");
        }
    }
}

#[async_trait]
impl RuleStore for StoreRuleRepository {
    async fn get_rule(&self, endpoint: &str) -> Result<Option<Rule>> {
        Ok(get_json(self.store.as_ref(), &rule_key(endpoint)).await?)
    }

    async fn get_all_rule_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .keys_matching(&format!("{}:*", RULE_KEY_PREFIX))
            .await?)
    }

    async fn get_all_rules(&self) -> Result<Vec<Rule>> {
        let keys = self.get_all_rule_keys().await?;
        let mut rules = Vec::with_capacity(keys.len());

        for key in keys {
            let parsed: StoreResult<Option<Rule>> = get_json(self.store.as_ref(), &key).await;
            match parsed {
                Ok(Some(rule)) => rules.push(rule),
                Ok(None) => {}
                Err(StoreError::Serialization(e)) => {
                    warn!(key = %key, error = %e, "Skipping unreadable rule");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(rules)
    }

    async fn set_rule(&self, rule: Rule) -> Result<()> {
        rule.check()?;

        set_json(self.store.as_ref(), &rule_key(&rule.endpoint), &rule).await?;
        info!(endpoint = %rule.endpoint, strategy = %rule.strategy, "Rule saved");

        self.announce(&rule.endpoint, RuleAction::Set).await;
        Ok(())
    }

    async fn delete_rule(&self, endpoint: &str) -> Result<()> {
        if endpoint.is_empty() {
            return Err(Error::InvalidRequest("endpoint must not be empty".to_string()));
        }

        self.store.delete(&rule_key(endpoint)).await?;
        info!(endpoint = %endpoint, "Rule deleted");

        self.announce(endpoint, RuleAction::Delete).await;
        Ok(())
    }
}

type RuleMap = HashMap<String, Arc<Rule>>;

/// Process-local snapshot of every valid rule, keyed by endpoint.
///
/// Readers clone an `Arc` to the current map; a refresh builds a whole new
/// map and swaps the pointer.
pub struct RuleCache {
    store: Arc<dyn RuleStore>,
    rules: RwLock<Arc<RuleMap>>,
    generation: watch::Sender<u64>,
}

impl RuleCache {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        let (generation, _) = watch::channel(0);

        Self {
            store,
            rules: RwLock::new(Arc::new(HashMap::new())),
            generation,
        }
    }

    /// Rebuilds the snapshot from the rules store. Invalid rules are dropped
    /// with a warning. On failure the previous snapshot stays in place.
    pub async fn cache_rules_locally(&self) -> Result<usize> {
        let rules = self.store.get_all_rules().await?;
        let mut fresh = HashMap::with_capacity(rules.len());

        for rule in rules {
            if let Err(e) = rule.check() {
                warn!(endpoint = %rule.endpoint, error = %e, "Ignoring invalid rule");
                continue;
            }
            fresh.insert(rule.endpoint.clone(), Arc::new(rule));
        }

        let count = fresh.len();
        {
            let mut rules = self
                .rules
                .write()
                .map_err(|_| Error::Config("rule cache lock poisoned".to_string()))?;
            *rules = Arc::new(fresh);
        }
        self.generation.send_modify(|generation| *generation += 1);

        info!(rules = count, "Rule cache refreshed");
        Ok(count)
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<Rule>> {
        self.snapshot().get(endpoint).cloned()
    }

    pub fn snapshot(&self) -> Arc<RuleMap> {
        self.rules
            .read()
            .map(|rules| Arc::clone(&*rules))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watches the refresh generation, bumped after every successful swap.
    pub fn subscribe_refreshes(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Keeps the cache in sync with `rules-update` announcements.
    ///
    /// A subscriber task forwards every announcement to a refresher task
    /// through a one-slot channel, so bursts of updates collapse into a single
    /// rebuild. Every (re)subscription also triggers a rebuild to cover
    /// anything published while the subscription was down.
    pub fn listen_to_rules_update(
        self: Arc<Self>,
        pubsub: Arc<dyn PubSub>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let (refresh_tx, refresh_rx) = mpsc::channel::<()>(1);
        let refresher = self.spawn_refresher(refresh_rx, shutdown.clone());

        tokio::spawn(async move {
            info!(topic = RULES_UPDATE_TOPIC, "Listening for rule updates");

            'outer: loop {
                let subscription = tokio::select! {
                    result = pubsub.subscribe(RULES_UPDATE_TOPIC) => result,
                    _ = shutdown.changed() => break,
                };

                match subscription {
                    Ok(mut updates) => {
                        let _ = refresh_tx.try_send(());

                        loop {
                            tokio::select! {
                                message = updates.next() => match message {
                                    Some(raw) => {
                                        match serde_json::from_str::<RuleUpdate>(&raw) {
                                            Ok(update) => debug!(
                                                endpoint = %update.endpoint,
                                                action = ?update.action,
                                                "Rule update received"
                                            ),
                                            Err(_) => debug!("Unrecognised rule update message"),
                                        }
                                        // Full means a refresh is already queued.
                                        let _ = refresh_tx.try_send(());
                                    }
                                    None => {
                                        warn!("Rule update subscription lost, resubscribing");
                                        break;
                                    }
                                },
                                _ = shutdown.changed() => break 'outer,
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Unable to subscribe to rule updates"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
                    _ = shutdown.changed() => break,
                }
            }

            drop(refresh_tx);
            let _ = refresher.await;
            info!("Rule update listener stopped");
        })
    }

    fn spawn_refresher(
        self: Arc<Self>,
        mut refresh_rx: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = refresh_rx.recv() => {
                        if signal.is_none() {
                            break;
                        }
                        if let Err(e) = self.cache_rules_locally().await {
                            warn!(error = %e, "Rule cache refresh failed, keeping previous rules");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
