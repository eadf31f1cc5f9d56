//! Webhook delivery workers.
//!
//! Deliveries are rows scheduled by `next_retry_at`. Workers claim due rows
//! with SKIP LOCKED (the claim is a lease: `next_retry_at` is pushed past
//! the request timeout, so a crashed worker just delays the attempt), POST
//! the signed payload, and either finalize the row or schedule the next
//! attempt on the escalating retry ladder.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::SecondsFormat;
use reqwest::Client;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::service::{delivery_from_row, DeliveryRow, WebhookService};
use super::signature::Signer;
use crate::errors::AppError;
use crate::models::webhook::{DeliveryStatus, Webhook, WebhookDelivery, WebhookPayload, WebhookStatus};

/// Escalating retry schedule. Attempts past the end reuse the last delay.
const RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(900),
    Duration::from_secs(3_600),
    Duration::from_secs(14_400),
];

const RESPONSE_BODY_LIMIT: usize = 1_000;
const CLAIM_BATCH: i64 = 20;

/// What happens to a delivery after a failed attempt. `attempts` counts the
/// attempt that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureDisposition {
    RetryAfter(Duration),
    PermanentlyFailed,
}

pub(crate) fn disposition_after_failure(attempts: u32, max_attempts: u32) -> FailureDisposition {
    if attempts >= max_attempts {
        FailureDisposition::PermanentlyFailed
    } else {
        let index = (attempts.saturating_sub(1) as usize).min(RETRY_DELAYS.len() - 1);
        FailureDisposition::RetryAfter(RETRY_DELAYS[index])
    }
}

pub(crate) fn should_auto_disable(consecutive_failures: i32, threshold: u32) -> bool {
    consecutive_failures >= threshold as i32
}

fn truncate_body(body: &str) -> String {
    if body.len() <= RESPONSE_BODY_LIMIT {
        return body.to_string();
    }
    let mut end = RESPONSE_BODY_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

enum AttemptOutcome {
    Success {
        status_code: i32,
    },
    Failure {
        error: String,
        status_code: Option<i32>,
        response_body: Option<String>,
    },
}

pub struct DeliveryWorker {
    service: WebhookService,
    client: Client,
    signer: Arc<dyn Signer>,
    timeout: Duration,
    auto_disable_threshold: u32,
}

impl DeliveryWorker {
    pub fn new(
        service: WebhookService,
        client: Client,
        signer: Arc<dyn Signer>,
        timeout: Duration,
        auto_disable_threshold: u32,
    ) -> Self {
        Self {
            service,
            client,
            signer,
            timeout,
            auto_disable_threshold,
        }
    }

    /// Delivers due webhooks until the process exits.
    pub async fn run(&self, poll_interval: Duration) {
        info!("webhook delivery worker started");
        loop {
            match self.run_once().await {
                Ok(0) => sleep(poll_interval).await,
                Ok(_) => {}
                Err(e) => {
                    error!("delivery worker error: {e}");
                    sleep(poll_interval).await;
                }
            }
        }
    }

    /// Claims and attempts one batch of due deliveries. Returns the batch
    /// size.
    pub async fn run_once(&self) -> Result<usize, AppError> {
        let deliveries = self.claim_due().await?;
        let claimed = deliveries.len();
        for delivery in deliveries {
            self.attempt(delivery).await?;
        }
        Ok(claimed)
    }

    async fn claim_due(&self) -> Result<Vec<WebhookDelivery>, AppError> {
        let lease = self.timeout + Duration::from_secs(60);
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            r#"
            UPDATE webhook_deliveries
            SET next_retry_at = NOW() + make_interval(secs => $1)
            WHERE id IN (
                SELECT id FROM webhook_deliveries
                WHERE status IN ('pending', 'failed') AND next_retry_at <= NOW()
                ORDER BY next_retry_at
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            RETURNING id, webhook_id, user_id, event_type, payload, status, attempts,
                      max_attempts, next_retry_at, delivered_at, response_status,
                      response_body, error, duration_ms, created_at
            "#,
        )
        .bind(lease.as_secs_f64())
        .bind(CLAIM_BATCH)
        .fetch_all(self.service.pool())
        .await?;

        Ok(rows.into_iter().map(delivery_from_row).collect())
    }

    /// One attempt for one delivery, used by both the worker loop and the
    /// subscription test endpoint.
    pub async fn attempt(&self, delivery: WebhookDelivery) -> Result<(), AppError> {
        if matches!(
            delivery.status,
            DeliveryStatus::Delivered | DeliveryStatus::PermanentlyFailed
        ) {
            return Ok(());
        }

        let Some(webhook) = self.service.fetch_webhook(delivery.webhook_id).await? else {
            self.finalize_failed(&delivery, "Webhook deleted").await?;
            return Ok(());
        };
        if webhook.status == WebhookStatus::Disabled {
            self.finalize_failed(&delivery, "Webhook disabled").await?;
            return Ok(());
        }

        let payload = WebhookPayload {
            id: delivery.id,
            event: delivery.event_type,
            created_at: delivery
                .created_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            data: delivery.payload.clone(),
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("payload serialization: {e}")))?;
        let signature = self.signer.sign(&body, &webhook.secret);

        debug!(
            delivery_id = %delivery.id,
            webhook_id = %webhook.id,
            attempt = delivery.attempts + 1,
            "attempting webhook delivery"
        );

        let started = Instant::now();
        let outcome = self.post(&webhook, &delivery, body, &signature).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            AttemptOutcome::Success { status_code } => {
                self.mark_delivered(&delivery, &webhook, status_code, duration_ms)
                    .await
            }
            AttemptOutcome::Failure {
                error,
                status_code,
                response_body,
            } => {
                self.mark_failed(
                    &delivery,
                    &webhook,
                    &error,
                    status_code,
                    response_body,
                    duration_ms,
                )
                .await
            }
        }
    }

    async fn post(
        &self,
        webhook: &Webhook,
        delivery: &WebhookDelivery,
        body: Vec<u8>,
        signature: &str,
    ) -> AttemptOutcome {
        let response = self
            .client
            .post(&webhook.url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", signature)
            .header("X-Webhook-Event", delivery.event_type.as_str())
            .header("X-Webhook-Delivery", delivery.id.to_string())
            .header("User-Agent", "Conveyor-Webhook/1.0")
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() < 300 {
                    AttemptOutcome::Success {
                        status_code: status.as_u16() as i32,
                    }
                } else {
                    let body = response.text().await.unwrap_or_default();
                    AttemptOutcome::Failure {
                        error: format!("HTTP {}", status.as_u16()),
                        status_code: Some(status.as_u16() as i32),
                        response_body: (!body.is_empty()).then(|| truncate_body(&body)),
                    }
                }
            }
            Err(e) if e.is_timeout() => AttemptOutcome::Failure {
                error: "Request timeout".to_string(),
                status_code: None,
                response_body: None,
            },
            Err(e) => AttemptOutcome::Failure {
                error: e.to_string(),
                status_code: None,
                response_body: None,
            },
        }
    }

    async fn mark_delivered(
        &self,
        delivery: &WebhookDelivery,
        webhook: &Webhook,
        status_code: i32,
        duration_ms: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'delivered', delivered_at = NOW(), next_retry_at = NULL,
                attempts = attempts + 1, response_status = $2, duration_ms = $3,
                error = NULL
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(status_code)
        .bind(duration_ms)
        .execute(self.service.pool())
        .await?;

        // Any success resets the failure streak.
        sqlx::query(
            r#"
            UPDATE webhooks
            SET consecutive_failures = 0, last_error = NULL,
                last_delivery_at = NOW(), last_success_at = NOW(),
                total_deliveries = total_deliveries + 1,
                successful_deliveries = successful_deliveries + 1
            WHERE id = $1
            "#,
        )
        .bind(webhook.id)
        .execute(self.service.pool())
        .await?;

        info!(
            delivery_id = %delivery.id,
            webhook_id = %webhook.id,
            status_code,
            duration_ms,
            "webhook delivered"
        );
        Ok(())
    }

    async fn mark_failed(
        &self,
        delivery: &WebhookDelivery,
        webhook: &Webhook,
        error: &str,
        status_code: Option<i32>,
        response_body: Option<String>,
        duration_ms: i64,
    ) -> Result<(), AppError> {
        let attempts = (delivery.attempts + 1).max(1) as u32;
        match disposition_after_failure(attempts, delivery.max_attempts.max(1) as u32) {
            FailureDisposition::RetryAfter(delay) => {
                sqlx::query(
                    r#"
                    UPDATE webhook_deliveries
                    SET status = 'failed', attempts = attempts + 1,
                        next_retry_at = NOW() + make_interval(secs => $2),
                        response_status = $3, response_body = $4, error = $5,
                        duration_ms = $6
                    WHERE id = $1
                    "#,
                )
                .bind(delivery.id)
                .bind(delay.as_secs_f64())
                .bind(status_code)
                .bind(&response_body)
                .bind(error)
                .bind(duration_ms)
                .execute(self.service.pool())
                .await?;

                warn!(
                    delivery_id = %delivery.id,
                    webhook_id = %webhook.id,
                    attempt = attempts,
                    retry_in_secs = delay.as_secs(),
                    "webhook delivery failed, will retry: {error}"
                );
            }
            FailureDisposition::PermanentlyFailed => {
                sqlx::query(
                    r#"
                    UPDATE webhook_deliveries
                    SET status = 'permanently_failed', attempts = attempts + 1,
                        next_retry_at = NULL, response_status = $2,
                        response_body = $3, error = $4, duration_ms = $5
                    WHERE id = $1
                    "#,
                )
                .bind(delivery.id)
                .bind(status_code)
                .bind(&response_body)
                .bind(error)
                .bind(duration_ms)
                .execute(self.service.pool())
                .await?;

                error!(
                    delivery_id = %delivery.id,
                    webhook_id = %webhook.id,
                    attempt = attempts,
                    "webhook delivery permanently failed: {error}"
                );
            }
        }

        self.record_webhook_failure(webhook.id, error).await
    }

    /// Finalizes a delivery whose webhook is gone or disabled; no attempt is
    /// made and the webhook's counters are untouched.
    async fn finalize_failed(
        &self,
        delivery: &WebhookDelivery,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'permanently_failed', next_retry_at = NULL, error = $2
            WHERE id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(error)
        .execute(self.service.pool())
        .await?;
        Ok(())
    }

    async fn record_webhook_failure(&self, webhook_id: Uuid, error: &str) -> Result<(), AppError> {
        let consecutive: i32 = sqlx::query_scalar(
            r#"
            UPDATE webhooks
            SET consecutive_failures = consecutive_failures + 1,
                total_deliveries = total_deliveries + 1,
                failed_deliveries = failed_deliveries + 1,
                last_delivery_at = NOW(), last_error = $2
            WHERE id = $1
            RETURNING consecutive_failures
            "#,
        )
        .bind(webhook_id)
        .bind(error)
        .fetch_one(self.service.pool())
        .await?;

        if should_auto_disable(consecutive, self.auto_disable_threshold) {
            sqlx::query(
                "UPDATE webhooks SET status = 'disabled', updated_at = NOW() WHERE id = $1",
            )
            .bind(webhook_id)
            .execute(self.service.pool())
            .await?;
            warn!(
                webhook_id = %webhook_id,
                consecutive_failures = consecutive,
                "webhook auto-disabled after consecutive failures"
            );
        }
        Ok(())
    }

    /// Immediate single attempt, used by the subscription test endpoint.
    pub async fn deliver_now(&self, delivery_id: Uuid) -> Result<Option<WebhookDelivery>, AppError> {
        let Some(delivery) = self.service.fetch_delivery(delivery_id).await? else {
            return Ok(None);
        };
        self.attempt(delivery).await?;
        self.service.fetch_delivery(delivery_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_ladder_escalates_then_plateaus() {
        let max = 10;
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| match disposition_after_failure(attempt, max) {
                FailureDisposition::RetryAfter(d) => d.as_secs(),
                FailureDisposition::PermanentlyFailed => panic!("below max"),
            })
            .collect();
        assert_eq!(delays, vec![60, 300, 900, 3_600, 14_400, 14_400]);
    }

    #[test]
    fn test_exhausted_attempts_are_permanent() {
        assert_eq!(
            disposition_after_failure(5, 5),
            FailureDisposition::PermanentlyFailed
        );
        assert!(matches!(
            disposition_after_failure(4, 5),
            FailureDisposition::RetryAfter(_)
        ));
    }

    #[test]
    fn test_auto_disable_fires_exactly_at_threshold() {
        assert!(!should_auto_disable(9, 10));
        assert!(should_auto_disable(10, 10));
        assert!(should_auto_disable(11, 10));
    }

    #[test]
    fn test_response_body_truncation_respects_char_boundaries() {
        let ascii = "x".repeat(2_000);
        assert_eq!(truncate_body(&ascii).len(), RESPONSE_BODY_LIMIT);

        // Multibyte char straddling the limit must not split.
        let tricky = format!("{}é{}", "x".repeat(RESPONSE_BODY_LIMIT - 1), "y".repeat(50));
        let truncated = truncate_body(&tricky);
        assert!(truncated.len() <= RESPONSE_BODY_LIMIT);
        assert!(truncated.is_char_boundary(truncated.len()));
    }
}
