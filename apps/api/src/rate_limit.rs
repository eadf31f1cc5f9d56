//! Per-user admission control.
//!
//! Fixed-window counter: each user gets `max_requests` submissions per
//! window, refilled at the window boundary. The counter mutation is a single
//! atomic operation in the backing store so concurrent requests, including
//! requests hitting different service instances, cannot overshoot the limit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::errors::AppError;

/// Outcome of an admission check. Both arms carry the reset time so the HTTP
/// layer can emit standard rate-limit headers.
#[derive(Debug, Clone, Copy)]
pub enum RateDecision {
    Allowed {
        remaining: u32,
        reset_at: DateTime<Utc>,
    },
    Denied {
        reset_at: DateTime<Utc>,
    },
}

/// Storage for per-user window counters. `incr` must be atomic across all
/// concurrent callers for the same user.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Increments the user's counter for the current window, starting a new
    /// window first if the previous one has elapsed. Returns the count after
    /// the increment and the window start.
    async fn incr(
        &self,
        user_id: &str,
        window: Duration,
    ) -> Result<(u32, DateTime<Utc>), AppError>;
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, limit: u32, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
        }
    }

    pub async fn allow(&self, user_id: &str) -> Result<RateDecision, AppError> {
        let (count, window_start) = self.store.incr(user_id, self.window).await?;
        let reset_at =
            window_start + chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());

        if count <= self.limit {
            Ok(RateDecision::Allowed {
                remaining: self.limit - count,
                reset_at,
            })
        } else {
            tracing::warn!(user_id, limit = self.limit, "rate limit exceeded");
            Ok(RateDecision::Denied { reset_at })
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

/// PostgreSQL-backed counter. The upsert resets and increments in one
/// statement, so the window rollover is atomic under concurrency.
pub struct PgRateLimitStore {
    pool: PgPool,
}

impl PgRateLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn incr(
        &self,
        user_id: &str,
        window: Duration,
    ) -> Result<(u32, DateTime<Utc>), AppError> {
        let (count, window_start): (i32, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO rate_limit_buckets (user_id, window_start, count)
            VALUES ($1, NOW(), 1)
            ON CONFLICT (user_id) DO UPDATE SET
                count = CASE
                    WHEN rate_limit_buckets.window_start <= NOW() - make_interval(secs => $2)
                        THEN 1
                    ELSE rate_limit_buckets.count + 1
                END,
                window_start = CASE
                    WHEN rate_limit_buckets.window_start <= NOW() - make_interval(secs => $2)
                        THEN NOW()
                    ELSE rate_limit_buckets.window_start
                END
            RETURNING count, window_start
            "#,
        )
        .bind(user_id)
        .bind(window.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;

        Ok((count.max(0) as u32, window_start))
    }
}

/// In-memory counter for single-instance deployments and tests. Replicated
/// deployments must use [`PgRateLimitStore`] so all instances share one
/// counter.
#[derive(Default)]
#[allow(dead_code)]
pub struct InMemoryRateLimitStore {
    buckets: Mutex<HashMap<String, (DateTime<Utc>, u32)>>,
}

impl InMemoryRateLimitStore {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn incr(
        &self,
        user_id: &str,
        window: Duration,
    ) -> Result<(u32, DateTime<Utc>), AppError> {
        let mut buckets = self.buckets.lock().expect("rate limit map poisoned");
        let now = Utc::now();
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());

        let bucket = buckets
            .entry(user_id.to_string())
            .or_insert((now, 0));

        if bucket.0 + window <= now {
            *bucket = (now, 0);
        }
        bucket.1 += 1;

        Ok((bucket.1, bucket.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryRateLimitStore::new()), limit, window)
    }

    #[tokio::test]
    async fn test_exactly_limit_calls_allowed_per_window() {
        let limiter = limiter(3, Duration::from_secs(3600));

        for expected_remaining in [2, 1, 0] {
            match limiter.allow("u1").await.unwrap() {
                RateDecision::Allowed { remaining, .. } => {
                    assert_eq!(remaining, expected_remaining)
                }
                RateDecision::Denied { .. } => panic!("denied below the limit"),
            }
        }

        assert!(matches!(
            limiter.allow("u1").await.unwrap(),
            RateDecision::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn test_denied_reset_is_within_one_window() {
        let window = Duration::from_secs(3600);
        let limiter = limiter(1, window);

        limiter.allow("u1").await.unwrap();
        match limiter.allow("u1").await.unwrap() {
            RateDecision::Denied { reset_at } => {
                let bound = Utc::now() + chrono::Duration::from_std(window).unwrap();
                assert!(reset_at <= bound);
            }
            RateDecision::Allowed { .. } => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn test_users_have_independent_buckets() {
        let limiter = limiter(1, Duration::from_secs(3600));

        limiter.allow("u1").await.unwrap();
        assert!(matches!(
            limiter.allow("u1").await.unwrap(),
            RateDecision::Denied { .. }
        ));
        assert!(matches!(
            limiter.allow("u2").await.unwrap(),
            RateDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_window_rollover_refills_the_bucket() {
        let limiter = limiter(1, Duration::ZERO);

        // A zero-length window expires immediately, so every call starts a
        // fresh window.
        for _ in 0..3 {
            assert!(matches!(
                limiter.allow("u1").await.unwrap(),
                RateDecision::Allowed { .. }
            ));
        }
    }
}
