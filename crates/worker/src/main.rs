//! Worker-node entry point.
//!
//! Each process runs one dispatcher loop against the shared Postgres store.
//! Scale out by starting more processes with distinct node ids; the store's
//! atomic claim is the only coordination between them.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use mailroom_delivery::rate_limit::RateLimitConfig;
use mailroom_delivery::{BackoffPolicy, RetryManager};
use mailroom_infra::{
    Dispatcher, DispatcherConfig, InMemoryCampaignRepository, InMemoryRecipientRepository,
    LoggingMailSender, PostgresStore, ProgressTracker, RateLimiter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mailroom_observability::init();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set (postgres://...)")?;
    let pool = PgPoolOptions::new()
        .max_connections(env_or("MAILROOM_DB_POOL_SIZE", 10))
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;

    let store = Arc::new(PostgresStore::new(pool));
    store
        .ensure_schema()
        .await
        .context("failed to apply schema")?;

    let mut config = DispatcherConfig::default()
        .with_poll_interval(Duration::from_secs(env_or("MAILROOM_POLL_INTERVAL_SECS", 30)))
        .with_max_concurrent_jobs(env_or("MAILROOM_MAX_CONCURRENT_JOBS", 50))
        .with_inter_send_delay(Duration::from_millis(env_or(
            "MAILROOM_INTER_SEND_DELAY_MS",
            1000,
        )));
    if let Ok(node_id) = std::env::var("MAILROOM_NODE_ID") {
        config = config.with_node_id(node_id);
    }

    let limits = RateLimitConfig {
        hourly_limit: env_or("MAILROOM_HOURLY_LIMIT", 100),
        daily_limit: env_or("MAILROOM_DAILY_LIMIT", 1000),
        min_send_interval: Duration::from_millis(env_or("MAILROOM_MIN_SEND_INTERVAL_MS", 2000)),
    };

    // The mail provider adapter and the campaign/recipient repositories
    // belong to the surrounding application; standalone workers run with
    // the logging transport and in-memory aggregates.
    tracing::warn!("no provider adapter configured; using logging transport");
    let tracker = ProgressTracker::new(
        Arc::new(InMemoryCampaignRepository::new()),
        Arc::new(InMemoryRecipientRepository::new()),
    );

    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(RateLimiter::new(store, limits)),
        Arc::new(LoggingMailSender),
        tracker,
        RetryManager::new(BackoffPolicy::default()),
        config.clone(),
    );

    tracing::info!(node = %config.node_id, "worker starting");
    let handle = dispatcher.spawn();

    shutdown_signal().await;
    tracing::info!("shutdown requested, draining current tick");
    handle.shutdown().await;
    tracing::info!("worker stopped");
    Ok(())
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparseable env override, using default");
                default
            }
        },
        Err(_) => default,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
