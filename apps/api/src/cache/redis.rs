//! Redis primary cache backend.
//!
//! Connection setup is lazy and the multiplexed connection is reused across
//! operations; a Redis that is down at boot only costs breaker failures, not
//! a failed startup.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use super::{CacheBackend, CacheBackendError};

pub struct RedisBackend {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            connection: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheBackendError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheBackendError(e.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drops the cached connection so the next operation reconnects.
    async fn invalidate_connection(&self) {
        *self.connection.lock().await = None;
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheBackendError> {
        let mut conn = self.connection().await?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.invalidate_connection().await;
                Err(CacheBackendError(e.to_string()))
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheBackendError> {
        let mut conn = self.connection().await?;
        match conn
            .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.invalidate_connection().await;
                Err(CacheBackendError(e.to_string()))
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheBackendError> {
        let mut conn = self.connection().await?;
        match conn.del::<_, ()>(key).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.invalidate_connection().await;
                Err(CacheBackendError(e.to_string()))
            }
        }
    }
}
