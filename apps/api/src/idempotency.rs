//! Duplicate-submission gate keyed by a client-supplied idempotency key.
//!
//! A key is scoped per user. The first request claims the key ("in flight"),
//! processes normally and stores its response; any repeat within the TTL
//! replays that response verbatim. A repeat arriving while the first request
//! is still in flight is rejected with a conflict so it can retry later.
//! First-write-wins: a differing request body under a reused key does not
//! invalidate the stored response.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::errors::AppError;

/// Result of claiming a key: either the caller owns the key and must process
/// the request, or a finished twin already exists and its response is
/// replayed.
#[derive(Debug, Clone)]
pub enum Reservation {
    Fresh,
    Replay(serde_json::Value),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claims `(user_id, key)` if no unexpired record exists. Fails with
    /// [`AppError::IdempotencyConflict`] while a concurrent holder is still
    /// in flight.
    async fn check_and_reserve(&self, user_id: &str, key: &str) -> Result<Reservation, AppError>;

    /// Records the final response for a claimed key so later repeats replay it.
    async fn store(
        &self,
        user_id: &str,
        key: &str,
        response: serde_json::Value,
    ) -> Result<(), AppError>;

    /// Releases a claimed key after a failed submission so the client may
    /// retry with the same key.
    async fn release(&self, user_id: &str, key: &str) -> Result<(), AppError>;
}

/// PostgreSQL-backed store. All claims go through conditional writes so the
/// unique-per-(user, key) invariant holds across service instances; the
/// store is the lock. Expired rows are treated as absent here and physically
/// removed by an external sweep.
pub struct PgIdempotencyStore {
    pool: PgPool,
    ttl: Duration,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    fn expiry(&self) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero())
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn check_and_reserve(&self, user_id: &str, key: &str) -> Result<Reservation, AppError> {
        let claimed = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (user_id, key, status, created_at, expires_at)
            VALUES ($1, $2, 'in_flight', NOW(), $3)
            ON CONFLICT (user_id, key) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(key)
        .bind(self.expiry())
        .execute(&self.pool)
        .await?;

        if claimed.rows_affected() == 1 {
            return Ok(Reservation::Fresh);
        }

        let row: Option<(String, Option<serde_json::Value>, chrono::DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT status, response, expires_at FROM idempotency_keys
                 WHERE user_id = $1 AND key = $2",
            )
            .bind(user_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some((status, response, expires_at)) = row else {
            // The holder released between our insert and select; the client
            // can simply retry.
            return Err(AppError::IdempotencyConflict {
                key: key.to_string(),
            });
        };

        if expires_at <= Utc::now() {
            // Expired record: reclaim it. The WHERE clause makes this a
            // compare-and-set so only one of several racing requests wins.
            let reclaimed = sqlx::query(
                r#"
                UPDATE idempotency_keys
                SET status = 'in_flight', response = NULL, created_at = NOW(), expires_at = $3
                WHERE user_id = $1 AND key = $2 AND expires_at <= NOW()
                "#,
            )
            .bind(user_id)
            .bind(key)
            .bind(self.expiry())
            .execute(&self.pool)
            .await?;

            if reclaimed.rows_affected() == 1 {
                return Ok(Reservation::Fresh);
            }
            return Err(AppError::IdempotencyConflict {
                key: key.to_string(),
            });
        }

        match response {
            Some(body) if status == "completed" => {
                tracing::info!(user_id, key, "replaying cached idempotent response");
                Ok(Reservation::Replay(body))
            }
            _ => Err(AppError::IdempotencyConflict {
                key: key.to_string(),
            }),
        }
    }

    async fn store(
        &self,
        user_id: &str,
        key: &str,
        response: serde_json::Value,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE idempotency_keys SET status = 'completed', response = $3
             WHERE user_id = $1 AND key = $2",
        )
        .bind(user_id)
        .bind(key)
        .bind(response)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, user_id: &str, key: &str) -> Result<(), AppError> {
        sqlx::query(
            "DELETE FROM idempotency_keys
             WHERE user_id = $1 AND key = $2 AND status = 'in_flight'",
        )
        .bind(user_id)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

enum EntryState {
    InFlight,
    Completed(serde_json::Value),
}

struct Entry {
    state: EntryState,
    created_at: Instant,
}

/// In-memory store for single-instance deployments and tests. Multi-instance
/// deployments must use [`PgIdempotencyStore`]; a process-local map cannot
/// deduplicate across replicas.
#[allow(dead_code)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<(String, String), Entry>>,
    ttl: Duration,
}

impl InMemoryIdempotencyStore {
    #[allow(dead_code)]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check_and_reserve(&self, user_id: &str, key: &str) -> Result<Reservation, AppError> {
        let mut entries = self.entries.lock().expect("idempotency map poisoned");
        let map_key = (user_id.to_string(), key.to_string());

        if let Some(entry) = entries.get(&map_key) {
            if entry.created_at.elapsed() < self.ttl {
                return match &entry.state {
                    EntryState::Completed(body) => Ok(Reservation::Replay(body.clone())),
                    EntryState::InFlight => Err(AppError::IdempotencyConflict {
                        key: key.to_string(),
                    }),
                };
            }
        }

        entries.insert(
            map_key,
            Entry {
                state: EntryState::InFlight,
                created_at: Instant::now(),
            },
        );
        Ok(Reservation::Fresh)
    }

    async fn store(
        &self,
        user_id: &str,
        key: &str,
        response: serde_json::Value,
    ) -> Result<(), AppError> {
        let mut entries = self.entries.lock().expect("idempotency map poisoned");
        if let Some(entry) = entries.get_mut(&(user_id.to_string(), key.to_string())) {
            entry.state = EntryState::Completed(response);
        }
        Ok(())
    }

    async fn release(&self, user_id: &str, key: &str) -> Result<(), AppError> {
        let mut entries = self.entries.lock().expect("idempotency map poisoned");
        let map_key = (user_id.to_string(), key.to_string());
        if let Some(entry) = entries.get(&map_key) {
            if matches!(entry.state, EntryState::InFlight) {
                entries.remove(&map_key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_fresh_then_conflict_while_in_flight() {
        let store = InMemoryIdempotencyStore::new(TTL);

        assert!(matches!(
            store.check_and_reserve("u1", "k1").await.unwrap(),
            Reservation::Fresh
        ));
        assert!(matches!(
            store.check_and_reserve("u1", "k1").await,
            Err(AppError::IdempotencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_replay_returns_stored_response_verbatim() {
        let store = InMemoryIdempotencyStore::new(TTL);
        let response = json!({"application_id": "abc", "status": "pending"});

        store.check_and_reserve("u1", "k1").await.unwrap();
        store.store("u1", "k1", response.clone()).await.unwrap();

        match store.check_and_reserve("u1", "k1").await.unwrap() {
            Reservation::Replay(body) => assert_eq!(body, response),
            Reservation::Fresh => panic!("expected replay"),
        }
    }

    #[tokio::test]
    async fn test_keys_are_scoped_per_user() {
        let store = InMemoryIdempotencyStore::new(TTL);

        store.check_and_reserve("u1", "k1").await.unwrap();
        store.store("u1", "k1", json!({"ok": true})).await.unwrap();

        // Same key, different user: fresh.
        assert!(matches!(
            store.check_and_reserve("u2", "k1").await.unwrap(),
            Reservation::Fresh
        ));
    }

    #[tokio::test]
    async fn test_release_allows_retry_with_same_key() {
        let store = InMemoryIdempotencyStore::new(TTL);

        store.check_and_reserve("u1", "k1").await.unwrap();
        store.release("u1", "k1").await.unwrap();

        assert!(matches!(
            store.check_and_reserve("u1", "k1").await.unwrap(),
            Reservation::Fresh
        ));
    }

    #[tokio::test]
    async fn test_expired_record_is_treated_as_absent() {
        let store = InMemoryIdempotencyStore::new(Duration::ZERO);

        store.check_and_reserve("u1", "k1").await.unwrap();
        store.store("u1", "k1", json!({"ok": true})).await.unwrap();

        assert!(matches!(
            store.check_and_reserve("u1", "k1").await.unwrap(),
            Reservation::Fresh
        ));
    }
}
