//! Fanout event-delivery service.
//!
//! Main entry point for the fanout worker process. Wires the queue,
//! adapters, and worker pool together from environment configuration
//! and coordinates graceful startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use fanout_core::{RealClock, TracingSink};
use fanout_delivery::{
    DeliveryConfig, FanoutEngine, InMemoryPublisher, InMemoryQueue, InMemoryQueueConfig,
    PubSubAdapter, RetryPolicy, TaskRegistry, WebhookAdapter, WebhookConfig,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting fanout event-delivery service");

    let config = Config::from_env()?;
    info!(
        broker_backend = %config.broker_backend,
        project_id = %config.project_id,
        worker_count = config.worker_count,
        max_attempts = config.retry_policy.max_attempts,
        "Configuration loaded"
    );

    let clock = Arc::new(RealClock::new());
    let queue = Arc::new(InMemoryQueue::new(InMemoryQueueConfig::default(), clock.clone()));

    let webhook = WebhookAdapter::new(WebhookConfig {
        timeout: config.delivery_timeout,
        ..Default::default()
    })
    .context("Failed to build webhook adapter")?;

    let publisher = Arc::new(InMemoryPublisher::new());
    let pubsub = PubSubAdapter::new(publisher, &config.project_id);

    let registry = TaskRegistry::new()
        .with_adapter(Arc::new(webhook))
        .with_adapter(Arc::new(pubsub));

    let delivery_config = DeliveryConfig {
        worker_count: config.worker_count,
        delivery_timeout: config.delivery_timeout,
        retry_policy: config.retry_policy.clone(),
        ..Default::default()
    };

    let mut engine = FanoutEngine::new(queue, registry, delivery_config)
        .with_clock(clock)
        .with_sink(Arc::new(TracingSink::new()));
    engine.start().context("Failed to start delivery engine")?;

    info!("Fanout is ready to deliver events");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Graceful shutdown incomplete");
    }

    info!(
        delivered = engine.stats().delivered(),
        retried = engine.stats().retried(),
        failed = engine.stats().failed(),
        "Fanout shutdown complete"
    );
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,fanout=debug"))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Service configuration.
struct Config {
    /// Queue transport backend. Only "memory" ships in-process; other
    /// values require a broker-backed `DispatchQueue` implementation.
    broker_backend: String,
    /// Project namespace for pub/sub topic paths.
    project_id: String,
    /// Number of delivery workers.
    worker_count: usize,
    /// Ceiling on a single delivery attempt.
    delivery_timeout: Duration,
    /// Retry policy for failed attempts.
    retry_policy: RetryPolicy,
}

impl Config {
    /// Loads configuration from environment variables.
    fn from_env() -> Result<Self> {
        let broker_backend =
            std::env::var("FANOUT_BROKER_BACKEND").unwrap_or_else(|_| "memory".to_string());
        let broker_url = std::env::var("FANOUT_BROKER_URL").ok();
        if broker_backend != "memory" {
            anyhow::bail!(
                "unsupported FANOUT_BROKER_BACKEND: {broker_backend} \
                 (FANOUT_BROKER_URL: {})",
                broker_url.as_deref().unwrap_or("<unset>")
            );
        }
        if broker_url.is_some() {
            warn!("FANOUT_BROKER_URL is set but the memory backend takes no URL, ignoring");
        }

        let project_id =
            std::env::var("FANOUT_PROJECT_ID").unwrap_or_else(|_| "fanout-local".to_string());

        let worker_count = env_parse("FANOUT_CONCURRENCY", 4_usize)?;
        let delivery_timeout = Duration::from_secs(env_parse("FANOUT_DELIVERY_TIMEOUT_SECS", 30)?);

        let retry_policy = RetryPolicy {
            max_attempts: env_parse("FANOUT_MAX_ATTEMPTS", 5)?,
            base_delay: Duration::from_millis(env_parse("FANOUT_BACKOFF_BASE_MS", 1000)?),
            max_delay: Duration::from_millis(env_parse("FANOUT_BACKOFF_CAP_MS", 300_000)?),
            ..Default::default()
        };

        Ok(Self { broker_backend, project_id, worker_count, delivery_timeout, retry_policy })
    }
}

/// Reads an environment variable, falling back to a default when unset.
fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| anyhow::anyhow!("Invalid {name}: {value}")),
        Err(_) => Ok(default),
    }
}
