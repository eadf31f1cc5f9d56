//! PostgreSQL-backed queue transport.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so competing consumers never block
//! each other on the same row, and a `locked_until` column implements the
//! visibility timeout: a consumer that crashes without acking simply lets
//! the lock lapse and the message is claimed again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{DeadLetter, Delivery, QueueDepths, QueueError, QueueMessage, QueueTransport};

pub struct PgQueue {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }
}

type MessageRow = (
    i64,
    Uuid,
    String,
    serde_json::Value,
    i32,
    Uuid,
    DateTime<Utc>,
);

fn row_to_delivery(row: MessageRow) -> Delivery {
    let (id, application_id, user_id, payload, retry_count, correlation_id, enqueued_at) = row;
    Delivery {
        receipt: id,
        message: QueueMessage {
            application_id,
            user_id,
            payload,
            retry_count: retry_count.max(0) as u32,
            correlation_id,
            enqueued_at,
        },
    }
}

#[async_trait::async_trait]
impl QueueTransport for PgQueue {
    async fn publish(&self, message: QueueMessage) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO queue_messages
                (application_id, user_id, payload, retry_count, correlation_id,
                 enqueued_at, available_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(message.application_id)
        .bind(&message.user_id)
        .bind(&message.payload)
        .bind(message.retry_count as i32)
        .bind(message.correlation_id)
        .bind(message.enqueued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET locked_until = NOW() + make_interval(secs => $1)
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE available_at <= NOW()
                  AND (locked_until IS NULL OR locked_until <= NOW())
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, application_id, user_id, payload, retry_count,
                      correlation_id, enqueued_at
            "#,
        )
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(delivery.receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        requeue: bool,
        delay: Duration,
    ) -> Result<(), QueueError> {
        if requeue {
            sqlx::query(
                r#"
                UPDATE queue_messages
                SET retry_count = retry_count + 1,
                    available_at = NOW() + make_interval(secs => $2),
                    locked_until = NULL
                WHERE id = $1
                "#,
            )
            .bind(delivery.receipt)
            .bind(delay.as_secs_f64())
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("DELETE FROM queue_messages WHERE id = $1")
                .bind(delivery.receipt)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn publish_dead_letter(
        &self,
        message: &QueueMessage,
        error: &str,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters
                (application_id, user_id, payload, retry_count, correlation_id,
                 error, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(message.application_id)
        .bind(&message.user_id)
        .bind(&message.payload)
        .bind(message.retry_count as i32)
        .bind(message.correlation_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn depths(&self) -> Result<QueueDepths, QueueError> {
        let ready: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(&self.pool)
            .await?;
        let dead: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(QueueDepths {
            ready: ready.max(0) as u64,
            dead_letters: dead.max(0) as u64,
        })
    }

    async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>, QueueError> {
        let rows: Vec<(
            i64,
            Uuid,
            String,
            serde_json::Value,
            i32,
            Uuid,
            String,
            DateTime<Utc>,
        )> = sqlx::query_as(
            r#"
            SELECT id, application_id, user_id, payload, retry_count,
                   correlation_id, error, failed_at
            FROM dead_letters
            ORDER BY failed_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, application_id, user_id, payload, retry_count, correlation_id, error, failed_at)| {
                    DeadLetter {
                        id,
                        application_id,
                        user_id,
                        payload,
                        retry_count: retry_count.max(0) as u32,
                        correlation_id,
                        error,
                        failed_at,
                    }
                },
            )
            .collect())
    }

    async fn requeue_dead_letter(&self, id: i64) -> Result<bool, QueueError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Uuid, String, serde_json::Value, Uuid)> = sqlx::query_as(
            "SELECT application_id, user_id, payload, correlation_id
             FROM dead_letters WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((application_id, user_id, payload, correlation_id)) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        // Requeued messages get a fresh retry budget.
        sqlx::query(
            r#"
            INSERT INTO queue_messages
                (application_id, user_id, payload, retry_count, correlation_id,
                 enqueued_at, available_at)
            VALUES ($1, $2, $3, 0, $4, NOW(), NOW())
            "#,
        )
        .bind(application_id)
        .bind(&user_id)
        .bind(&payload)
        .bind(correlation_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn discard_dead_letter(&self, id: i64) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
