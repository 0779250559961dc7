use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::handlers::{check_limit, delete_rule, get_rules, health_check, set_rule, AppState};
use crate::health::HealthMonitor;
use crate::memory_store::InMemoryStore;
use crate::middleware::logging_middleware;
use crate::notification::{ErrorNotifier, LogNotifier};
use crate::rate_limit_config::RulesFile;
use crate::redis::RedisStore;
use crate::resilient::ResilientStore;
use crate::rules::{RuleCache, RuleStore, StoreRuleRepository};
use crate::throttler::Throttler;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Builds the HTTP router over an already wired [`AppState`].
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/check", post(check_limit))
        .route("/rules", get(get_rules).post(set_rule).delete(delete_rule))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    config: Config,
    state: AppState,
    memory: Arc<InMemoryStore>,
    limiter_redis: Arc<RedisStore>,
    rules_redis: Arc<RedisStore>,
    cache: Arc<RuleCache>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let timeout = config.store_timeout();

        let limiter_redis = Arc::new(RedisStore::new(&config.redis_url, timeout)?);
        let memory = Arc::new(InMemoryStore::new(clock.clone()));
        let limiter_store = Arc::new(ResilientStore::new(limiter_redis.clone(), memory.clone()));

        let rules_redis = Arc::new(RedisStore::new(config.rules_redis_url(), timeout)?);
        let rules: Arc<dyn RuleStore> = Arc::new(StoreRuleRepository::new(
            rules_redis.clone(),
            rules_redis.clone(),
        ));
        let cache = Arc::new(RuleCache::new(rules.clone()));

        let notifier = ErrorNotifier::new(
            Arc::new(LogNotifier),
            clock.clone(),
            config.notification_cooldown(),
        );
        let throttler = Arc::new(Throttler::new(
            limiter_store.clone(),
            cache.clone(),
            clock,
            notifier,
        ));

        Ok(Self {
            config,
            state: AppState {
                throttler,
                rules,
                limiter_store,
                started_at: Instant::now(),
            },
            memory,
            limiter_redis,
            rules_redis,
            cache,
        })
    }

    /// Seeds rules from the configured rules file, if any.
    async fn seed_rules(&self) -> Result<()> {
        let Some(path) = &self.config.rules_file else {
            return Ok(());
        };

        let rules = RulesFile::load(path)?.valid_rules();
        tracing::info!(path = %path.display(), rules = rules.len(), "Loading rules file");

        for rule in rules {
            let endpoint = rule.endpoint.clone();
            if let Err(e) = self.state.rules.set_rule(rule).await {
                tracing::warn!(endpoint = %endpoint, error = %e, "Failed to store rule from rules file");
            }
        }

        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        self.seed_rules().await?;

        if let Err(e) = self.cache.cache_rules_locally().await {
            tracing::warn!(error = %e, "Rules store unavailable, starting with an empty rule cache");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interval = self.config.health_check_interval();

        let limiter_monitor = HealthMonitor::new(self.limiter_redis.clone(), interval)
            .named("limiter")
            .restores(self.state.limiter_store.clone());
        let rules_monitor = HealthMonitor::new(self.rules_redis.clone(), interval)
            .named("rules")
            .refreshes(self.cache.clone());

        let tasks = vec![
            self.cache
                .clone()
                .listen_to_rules_update(self.rules_redis.clone(), shutdown_rx.clone()),
            self.state
                .throttler
                .token_bucket()
                .spawn_refill(self.config.token_refill_interval(), shutdown_rx.clone()),
            self.memory
                .clone()
                .spawn_sweeper(self.config.memory_sweep_interval(), shutdown_rx.clone()),
            Arc::new(limiter_monitor).spawn(shutdown_rx.clone()),
            Arc::new(rules_monitor).spawn(shutdown_rx),
        ];

        let app = create_app(self.state.clone());
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        tracing::info!("Gatekeeper listening on {}", self.config.bind_addr);
        tracing::info!("Admission checks available at POST /check");
        tracing::info!("Health check available at /health");

        // Run server with graceful shutdown
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        let _ = shutdown_tx.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        tracing::info!("Gatekeeper stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
