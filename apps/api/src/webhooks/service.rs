//! Webhook subscription management and event fan-out.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::events::StatusChangedEvent;
use crate::models::webhook::{
    Webhook, WebhookCreate, WebhookDelivery, WebhookEventType, WebhookStatus,
};

const SECRET_LENGTH: usize = 48;

#[derive(Clone)]
pub struct WebhookService {
    pool: PgPool,
    max_per_user: i64,
    require_https: bool,
    max_attempts: u32,
}

impl WebhookService {
    pub fn new(pool: PgPool, max_per_user: i64, require_https: bool, max_attempts: u32) -> Self {
        Self {
            pool,
            max_per_user,
            require_https,
            max_attempts,
        }
    }

    pub async fn create_webhook(
        &self,
        user_id: &str,
        request: WebhookCreate,
    ) -> Result<Webhook, AppError> {
        if request.events.is_empty() {
            return Err(AppError::Validation(
                "At least one event type must be subscribed".to_string(),
            ));
        }
        if self.require_https && !request.url.starts_with("https://") {
            return Err(AppError::Validation(
                "Webhook URL must use HTTPS".to_string(),
            ));
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhooks WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        if count >= self.max_per_user {
            return Err(AppError::Validation(format!(
                "Maximum webhooks ({}) reached",
                self.max_per_user
            )));
        }

        let now = Utc::now();
        let webhook = Webhook {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            url: request.url,
            secret: generate_secret(),
            events: request.events,
            status: WebhookStatus::Active,
            consecutive_failures: 0,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_delivery_at: None,
            last_success_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let events: Vec<String> = webhook.events.iter().map(|e| e.as_str().to_string()).collect();
        sqlx::query(
            r#"
            INSERT INTO webhooks
                (id, user_id, url, secret, events, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(webhook.id)
        .bind(&webhook.user_id)
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(&events)
        .bind(webhook.status.as_str())
        .bind(webhook.created_at)
        .bind(webhook.updated_at)
        .execute(&self.pool)
        .await?;

        info!(
            webhook_id = %webhook.id,
            user_id,
            events = ?events,
            "webhook created"
        );
        Ok(webhook)
    }

    pub async fn get_webhook(
        &self,
        id: Uuid,
        user_id: &str,
    ) -> Result<Option<Webhook>, AppError> {
        let row: Option<WebhookRow> =
            sqlx::query_as(&format!("{SELECT_WEBHOOK} WHERE id = $1 AND user_id = $2"))
                .bind(id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(webhook_from_row))
    }

    pub(crate) async fn fetch_webhook(&self, id: Uuid) -> Result<Option<Webhook>, AppError> {
        let row: Option<WebhookRow> =
            sqlx::query_as(&format!("{SELECT_WEBHOOK} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(webhook_from_row))
    }

    pub async fn list_webhooks(&self, user_id: &str) -> Result<Vec<Webhook>, AppError> {
        let rows: Vec<WebhookRow> = sqlx::query_as(&format!(
            "{SELECT_WEBHOOK} WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(webhook_from_row).collect())
    }

    /// Deletes a webhook and its delivery history.
    pub async fn delete_webhook(&self, id: Uuid, user_id: &str) -> Result<bool, AppError> {
        let deleted = sqlx::query("DELETE FROM webhooks WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query("DELETE FROM webhook_deliveries WHERE webhook_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        info!(webhook_id = %id, user_id, "webhook deleted");
        Ok(true)
    }

    /// Operator action: re-enables an auto-disabled webhook and clears its
    /// failure streak.
    pub async fn enable_webhook(&self, id: Uuid, user_id: &str) -> Result<bool, AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE webhooks
            SET status = 'active', consecutive_failures = 0, last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 1 {
            info!(webhook_id = %id, user_id, "webhook re-enabled");
            return Ok(true);
        }
        Ok(false)
    }

    /// Fans a status-changed event out to every active subscription of the
    /// owning user that listens for it. Each match becomes one delivery row,
    /// ready for immediate pickup by the delivery workers.
    pub async fn dispatch_event(
        &self,
        event: &StatusChangedEvent,
    ) -> Result<Vec<Uuid>, AppError> {
        let event_type = event.event_type();
        let matching: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM webhooks
            WHERE user_id = $1 AND status = 'active' AND $2 = ANY(events)
            "#,
        )
        .bind(&event.user_id)
        .bind(event_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        if matching.is_empty() {
            return Ok(Vec::new());
        }

        let payload = event.payload_data();
        let mut delivery_ids = Vec::with_capacity(matching.len());
        for (webhook_id,) in matching {
            let delivery_id = Uuid::new_v4();
            sqlx::query(
                r#"
                INSERT INTO webhook_deliveries
                    (id, webhook_id, user_id, event_type, payload, status,
                     attempts, max_attempts, next_retry_at, created_at)
                VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, NOW(), NOW())
                "#,
            )
            .bind(delivery_id)
            .bind(webhook_id)
            .bind(&event.user_id)
            .bind(event_type.as_str())
            .bind(&payload)
            .bind(self.max_attempts as i32)
            .execute(&self.pool)
            .await?;
            delivery_ids.push(delivery_id);
        }

        info!(
            event = %event_type,
            user_id = %event.user_id,
            webhook_count = delivery_ids.len(),
            "event dispatched to webhooks"
        );
        Ok(delivery_ids)
    }

    pub async fn list_deliveries(
        &self,
        webhook_id: Uuid,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, AppError> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "{SELECT_DELIVERY} WHERE webhook_id = $1 AND user_id = $2
             ORDER BY created_at DESC LIMIT $3"
        ))
        .bind(webhook_id)
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(delivery_from_row).collect())
    }

    pub(crate) async fn fetch_delivery(
        &self,
        id: Uuid,
    ) -> Result<Option<WebhookDelivery>, AppError> {
        let row: Option<DeliveryRow> =
            sqlx::query_as(&format!("{SELECT_DELIVERY} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(delivery_from_row))
    }

    /// Inserts a synthetic delivery so an operator can exercise an endpoint
    /// without waiting for a real event.
    pub async fn create_test_delivery(&self, webhook: &Webhook) -> Result<Uuid, AppError> {
        let delivery_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "test": true,
            "message": "This is a test webhook delivery",
            "timestamp": Utc::now().to_rfc3339(),
        });
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries
                (id, webhook_id, user_id, event_type, payload, status,
                 attempts, max_attempts, next_retry_at, created_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, NOW(), NOW())
            "#,
        )
        .bind(delivery_id)
        .bind(webhook.id)
        .bind(&webhook.user_id)
        .bind(WebhookEventType::ApplicationSubmitted.as_str())
        .bind(&payload)
        .bind(self.max_attempts as i32)
        .execute(&self.pool)
        .await?;
        Ok(delivery_id)
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LENGTH)
        .map(char::from)
        .collect()
}

pub(crate) const SELECT_WEBHOOK: &str =
    "SELECT id, user_id, url, secret, events, status, consecutive_failures, \
     total_deliveries, successful_deliveries, failed_deliveries, \
     last_delivery_at, last_success_at, last_error, created_at, updated_at \
     FROM webhooks";

pub(crate) type WebhookRow = (
    Uuid,
    String,
    String,
    String,
    Vec<String>,
    String,
    i32,
    i64,
    i64,
    i64,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
);

pub(crate) fn webhook_from_row(row: WebhookRow) -> Webhook {
    let (
        id,
        user_id,
        url,
        secret,
        events,
        status,
        consecutive_failures,
        total_deliveries,
        successful_deliveries,
        failed_deliveries,
        last_delivery_at,
        last_success_at,
        last_error,
        created_at,
        updated_at,
    ) = row;
    Webhook {
        id,
        user_id,
        url,
        secret,
        events: events
            .iter()
            .filter_map(|e| WebhookEventType::parse(e))
            .collect(),
        status: WebhookStatus::parse(&status).unwrap_or(WebhookStatus::Disabled),
        consecutive_failures,
        total_deliveries,
        successful_deliveries,
        failed_deliveries,
        last_delivery_at,
        last_success_at,
        last_error,
        created_at,
        updated_at,
    }
}

pub(crate) const SELECT_DELIVERY: &str =
    "SELECT id, webhook_id, user_id, event_type, payload, status, attempts, \
     max_attempts, next_retry_at, delivered_at, response_status, response_body, \
     error, duration_ms, created_at \
     FROM webhook_deliveries";

pub(crate) type DeliveryRow = (
    Uuid,
    Uuid,
    String,
    String,
    serde_json::Value,
    String,
    i32,
    i32,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<i32>,
    Option<String>,
    Option<String>,
    Option<i64>,
    DateTime<Utc>,
);

pub(crate) fn delivery_from_row(row: DeliveryRow) -> WebhookDelivery {
    let (
        id,
        webhook_id,
        user_id,
        event_type,
        payload,
        status,
        attempts,
        max_attempts,
        next_retry_at,
        delivered_at,
        response_status,
        response_body,
        error,
        duration_ms,
        created_at,
    ) = row;
    WebhookDelivery {
        id,
        webhook_id,
        user_id,
        event_type: WebhookEventType::parse(&event_type)
            .unwrap_or(WebhookEventType::ApplicationSubmitted),
        payload,
        status: crate::models::webhook::DeliveryStatus::parse(&status)
            .unwrap_or(crate::models::webhook::DeliveryStatus::Pending),
        attempts,
        max_attempts,
        next_retry_at,
        delivered_at,
        response_status,
        response_body,
        error,
        duration_ms,
        created_at,
    }
}
