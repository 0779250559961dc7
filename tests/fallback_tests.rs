mod common;

use common::Harness;
use gatekeeper::health::HealthMonitor;
use gatekeeper::resilient::Liveness;
use gatekeeper::rules::RuleStore;
use gatekeeper::store::Store;
use gatekeeper::{DecisionStatus, Rule};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::assert_ok;

async fn with_rules(rules: Vec<Rule>) -> Harness {
    let harness = Harness::new();
    for rule in rules {
        assert_ok!(harness.rules.set_rule(rule).await);
    }
    assert_ok!(harness.cache.cache_rules_locally().await);
    harness
}

#[tokio::test]
async fn test_decisions_survive_primary_outage() {
    let harness = with_rules(vec![Rule::fixed_window("/x", 2, 60)]).await;
    harness.primary.set_down(true);

    let first = harness.throttler.check_limit("c", "/x").await;
    let second = harness.throttler.check_limit("c", "/x").await;
    let third = harness.throttler.check_limit("c", "/x").await;

    assert_eq!(first.status, DecisionStatus::Allowed);
    assert_eq!(second.status, DecisionStatus::Allowed);
    assert_eq!(third.status, DecisionStatus::LimitExceeded);
    assert_eq!(harness.limiter_store.health(), Liveness::Degraded);
    assert!(harness.fallback.get("fixed_window:c:/x").await.unwrap().is_some());
}

#[tokio::test]
async fn test_degraded_calls_skip_primary() {
    let harness = with_rules(vec![Rule::sliding_window("/x", 10, 60)]).await;
    harness.primary.set_down(true);
    harness.throttler.check_limit("c", "/x").await;

    let calls = harness.primary.calls.load(Ordering::SeqCst);
    for _ in 0..5 {
        harness.throttler.check_limit("c", "/x").await;
    }
    assert_eq!(harness.primary.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_probe_restores_primary() {
    let harness = with_rules(vec![Rule::token_bucket("/x", 5, 1, 60)]).await;
    let monitor = HealthMonitor::new(harness.primary.clone(), Duration::from_secs(30))
        .restores(harness.limiter_store.clone());

    harness.primary.set_down(true);
    harness.throttler.check_limit("c", "/x").await;
    assert!(!monitor.check_once().await);
    assert!(harness.limiter_store.is_degraded());

    harness.primary.set_down(false);
    assert!(monitor.check_once().await);
    assert_eq!(harness.limiter_store.health(), Liveness::Healthy);

    // Primary starts from its own state: a fresh bucket.
    let decision = harness.throttler.check_limit("c", "/x").await;
    assert_eq!(decision.remaining, 4);
    assert!(harness
        .primary
        .inner()
        .get("token_bucket:c:/x")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_rule_change_governs_next_check() {
    let harness = with_rules(vec![Rule::fixed_window("/x", 1, 60)]).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut refreshes = harness.cache.subscribe_refreshes();
    let baseline = *refreshes.borrow_and_update();

    let listener = harness
        .cache
        .clone()
        .listen_to_rules_update(harness.pubsub.clone(), shutdown_rx);
    tokio::time::timeout(
        Duration::from_secs(5),
        refreshes.wait_for(|generation| *generation > baseline),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(harness.throttler.check_limit("c", "/x").await.allowed);
    assert!(!harness.throttler.check_limit("c", "/x").await.allowed);

    harness
        .rules
        .set_rule(Rule::token_bucket("/x", 10, 1, 60))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = harness.cache.get("/x");
            if current.is_some_and(|rule| rule.token_bucket.is_some()) {
                break;
            }
            refreshes.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let decision = harness.throttler.check_limit("c", "/x").await;
    assert!(decision.allowed);
    assert_eq!(decision.limit, 10);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_refill_job_runs_until_shutdown() {
    let harness = with_rules(vec![Rule::token_bucket("/x", 1, 1, 600)]).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    assert!(harness.throttler.check_limit("c", "/x").await.allowed);
    assert!(!harness.throttler.check_limit("c", "/x").await.allowed);

    let job = Arc::clone(&harness.throttler.token_bucket())
        .spawn_refill(Duration::from_millis(20), shutdown_rx);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !harness.throttler.check_limit("c", "/x").await.allowed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), job)
        .await
        .unwrap()
        .unwrap();
}
