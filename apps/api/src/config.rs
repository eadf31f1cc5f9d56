use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    pub rust_log: String,

    // Admission control
    pub rate_limit_enabled: bool,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
    pub idempotency_ttl: Duration,

    // Queue / worker
    pub worker_count: usize,
    pub worker_poll_interval: Duration,
    pub queue_visibility_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub publish_retries: u32,

    // Webhooks
    pub webhooks_enabled: bool,
    pub webhook_timeout: Duration,
    pub webhook_max_attempts: u32,
    pub webhook_auto_disable_threshold: u32,
    pub webhook_require_https: bool,
    pub webhook_max_per_user: i64,
    pub webhook_worker_count: usize,
    pub webhook_poll_interval: Duration,

    // Cache
    pub cache_default_ttl: Duration,
    pub cache_failure_threshold: u32,
    pub cache_reset_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),

            rate_limit_enabled: parse_env("RATE_LIMIT_ENABLED", true)?,
            rate_limit_max_requests: parse_env("RATE_LIMIT_MAX_REQUESTS", 100)?,
            rate_limit_window: secs_env("RATE_LIMIT_WINDOW_SECONDS", 3600)?,
            idempotency_ttl: secs_env("IDEMPOTENCY_TTL_SECONDS", 86_400)?,

            worker_count: parse_env("WORKER_COUNT", 4)?,
            worker_poll_interval: millis_env("WORKER_POLL_INTERVAL_MS", 1_000)?,
            queue_visibility_timeout: secs_env("QUEUE_VISIBILITY_TIMEOUT_SECONDS", 300)?,
            max_retries: parse_env("MAX_RETRIES", 5)?,
            retry_base_delay: millis_env("RETRY_BASE_DELAY_MS", 1_000)?,
            retry_max_delay: millis_env("RETRY_MAX_DELAY_MS", 16_000)?,
            publish_retries: parse_env("PUBLISH_RETRIES", 3)?,

            webhooks_enabled: parse_env("WEBHOOKS_ENABLED", true)?,
            webhook_timeout: secs_env("WEBHOOK_TIMEOUT_SECONDS", 30)?,
            webhook_max_attempts: parse_env("WEBHOOK_MAX_ATTEMPTS", 5)?,
            webhook_auto_disable_threshold: parse_env("WEBHOOK_AUTO_DISABLE_THRESHOLD", 10)?,
            webhook_require_https: parse_env("WEBHOOK_REQUIRE_HTTPS", true)?,
            webhook_max_per_user: parse_env("WEBHOOK_MAX_PER_USER", 10)?,
            webhook_worker_count: parse_env("WEBHOOK_WORKER_COUNT", 2)?,
            webhook_poll_interval: millis_env("WEBHOOK_POLL_INTERVAL_MS", 1_000)?,

            cache_default_ttl: secs_env("CACHE_DEFAULT_TTL_SECONDS", 300)?,
            cache_failure_threshold: parse_env("CACHE_FAILURE_THRESHOLD", 5)?,
            cache_reset_timeout: secs_env("CACHE_RESET_TIMEOUT_SECONDS", 30)?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("'{key}' has an invalid value")),
        Err(_) => Ok(default),
    }
}

fn secs_env(key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parse_env(key, default)?))
}

fn millis_env(key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_millis(parse_env(key, default)?))
}
