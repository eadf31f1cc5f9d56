mod applications;
mod cache;
mod config;
mod db;
mod errors;
mod events;
mod idempotency;
mod models;
mod queue;
mod rate_limit;
mod routes;
mod state;
mod webhooks;
mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::applications::producer::SubmissionProducer;
use crate::applications::resume::ResumeStore;
use crate::applications::store::PgApplicationStore;
use crate::cache::redis::RedisBackend;
use crate::cache::{CacheKey, CacheLayer};
use crate::config::Config;
use crate::db::create_pool;
use crate::events::EventBus;
use crate::idempotency::PgIdempotencyStore;
use crate::queue::pg::PgQueue;
use crate::rate_limit::{PgRateLimitStore, RateLimiter};
use crate::routes::build_router;
use crate::state::AppState;
use crate::webhooks::delivery::DeliveryWorker;
use crate::webhooks::service::WebhookService;
use crate::webhooks::signature::HmacSha256Signer;
use crate::worker::processor::PortalSubmitter;
use crate::worker::retry::RetryPolicy;
use crate::worker::ProcessingWorker;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Conveyor API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let pool = create_pool(&config.database_url).await?;

    // Initialize Redis-backed cache behind the circuit breaker
    let redis = redis::Client::open(config.redis_url.clone())?;
    let cache = Arc::new(CacheLayer::new(
        Arc::new(RedisBackend::new(redis)),
        config.cache_failure_threshold,
        config.cache_reset_timeout,
        config.cache_default_ttl,
    ));
    info!("Cache layer initialized");

    // Pipeline components
    let events = EventBus::default();
    let store = Arc::new(PgApplicationStore::new(pool.clone()));
    let queue = Arc::new(PgQueue::new(
        pool.clone(),
        config.queue_visibility_timeout,
    ));
    let gate = Arc::new(PgIdempotencyStore::new(
        pool.clone(),
        config.idempotency_ttl,
    ));
    let limiter = config.rate_limit_enabled.then(|| {
        Arc::new(RateLimiter::new(
            Arc::new(PgRateLimitStore::new(pool.clone())),
            config.rate_limit_max_requests,
            config.rate_limit_window,
        ))
    });

    let producer = Arc::new(SubmissionProducer::new(
        store.clone(),
        queue.clone(),
        gate,
        limiter,
        events.clone(),
        config.publish_retries,
    ));
    let resumes = Arc::new(ResumeStore::new(pool.clone()));

    // Webhook subsystem
    let webhooks = WebhookService::new(
        pool.clone(),
        config.webhook_max_per_user,
        config.webhook_require_https,
        config.webhook_max_attempts,
    );
    let delivery = Arc::new(DeliveryWorker::new(
        webhooks.clone(),
        reqwest::Client::new(),
        Arc::new(HmacSha256Signer),
        config.webhook_timeout,
        config.webhook_auto_disable_threshold,
    ));

    // Processing workers (competing consumers on the queue)
    let policy = RetryPolicy {
        max_retries: config.max_retries,
        base_delay: config.retry_base_delay,
        max_delay: config.retry_max_delay,
    };
    for i in 1..=config.worker_count.max(1) {
        let worker = ProcessingWorker::new(
            store.clone(),
            queue.clone(),
            Arc::new(PortalSubmitter),
            events.clone(),
            policy,
        );
        let poll = config.worker_poll_interval;
        info!(worker = i, "starting processing worker");
        tokio::spawn(async move { worker.run(poll).await });
    }

    // Webhook delivery workers
    if config.webhooks_enabled {
        for i in 1..=config.webhook_worker_count.max(1) {
            let worker = delivery.clone();
            let poll = config.webhook_poll_interval;
            info!(worker = i, "starting webhook delivery worker");
            tokio::spawn(async move { worker.run(poll).await });
        }
    }

    // Event listener: cache invalidation and webhook fan-out
    spawn_event_listener(
        events.clone(),
        webhooks.clone(),
        cache.clone(),
        config.webhooks_enabled,
    );

    // Build app state
    let state = AppState {
        config: config.clone(),
        store,
        queue,
        producer,
        resumes,
        cache,
        webhooks,
        delivery,
        events,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: tighten CORS in production

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Subscribes to status-changed events: drops the stale status cache entry
/// for the application and fans the event out to webhook subscriptions.
fn spawn_event_listener(
    events: EventBus,
    webhooks: WebhookService,
    cache: Arc<CacheLayer>,
    webhooks_enabled: bool,
) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    cache
                        .delete(&CacheKey::application_status(
                            &event.user_id,
                            event.application_id,
                        ))
                        .await;
                    if webhooks_enabled {
                        if let Err(e) = webhooks.dispatch_event(&event).await {
                            error!(
                                application_id = %event.application_id,
                                "webhook dispatch failed: {e}"
                            );
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event listener lagged behind the bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
