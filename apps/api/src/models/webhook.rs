use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event types a subscription can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "application.submitted")]
    ApplicationSubmitted,
    #[serde(rename = "application.processing")]
    ApplicationProcessing,
    #[serde(rename = "application.completed")]
    ApplicationCompleted,
    #[serde(rename = "application.failed")]
    ApplicationFailed,
}

impl WebhookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::ApplicationSubmitted => "application.submitted",
            WebhookEventType::ApplicationProcessing => "application.processing",
            WebhookEventType::ApplicationCompleted => "application.completed",
            WebhookEventType::ApplicationFailed => "application.failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "application.submitted" => Some(WebhookEventType::ApplicationSubmitted),
            "application.processing" => Some(WebhookEventType::ApplicationProcessing),
            "application.completed" => Some(WebhookEventType::ApplicationCompleted),
            "application.failed" => Some(WebhookEventType::ApplicationFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription state. `Disabled` is set automatically after too many
/// consecutive failures and cleared only by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Active,
    Disabled,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Active => "active",
            WebhookStatus::Disabled => "disabled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(WebhookStatus::Active),
            "disabled" => Some(WebhookStatus::Disabled),
            _ => None,
        }
    }
}

/// Outcome states of a single scheduled delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    PermanentlyFailed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::PermanentlyFailed => "permanently_failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(DeliveryStatus::Pending),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            "permanently_failed" => Some(DeliveryStatus::PermanentlyFailed),
            _ => None,
        }
    }
}

/// A registered webhook subscription.
#[derive(Debug, Clone)]
pub struct Webhook {
    pub id: Uuid,
    pub user_id: String,
    pub url: String,
    pub secret: String,
    pub events: Vec<WebhookEventType>,
    pub status: WebhookStatus,
    pub consecutive_failures: i32,
    pub total_deliveries: i64,
    pub successful_deliveries: i64,
    pub failed_deliveries: i64,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request body for registering a webhook.
#[derive(Debug, Deserialize)]
pub struct WebhookCreate {
    pub url: String,
    pub events: Vec<WebhookEventType>,
}

/// Subscription as exposed over the API (no secret).
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub id: Uuid,
    pub user_id: String,
    pub url: String,
    pub events: Vec<WebhookEventType>,
    pub status: WebhookStatus,
    pub consecutive_failures: i32,
    pub total_deliveries: i64,
    pub successful_deliveries: i64,
    pub failed_deliveries: i64,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation response: the only place the signing secret is ever returned.
#[derive(Debug, Serialize)]
pub struct WebhookWithSecret {
    #[serde(flatten)]
    pub webhook: WebhookResponse,
    pub secret: String,
}

impl From<&Webhook> for WebhookResponse {
    fn from(wh: &Webhook) -> Self {
        WebhookResponse {
            id: wh.id,
            user_id: wh.user_id.clone(),
            url: wh.url.clone(),
            events: wh.events.clone(),
            status: wh.status,
            consecutive_failures: wh.consecutive_failures,
            total_deliveries: wh.total_deliveries,
            successful_deliveries: wh.successful_deliveries,
            failed_deliveries: wh.failed_deliveries,
            last_delivery_at: wh.last_delivery_at,
            last_success_at: wh.last_success_at,
            last_error: wh.last_error.clone(),
            created_at: wh.created_at,
            updated_at: wh.updated_at,
        }
    }
}

/// One scheduled attempt chain for a (webhook, event) pair.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub user_id: String,
    pub event_type: WebhookEventType,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Delivery record as exposed over the API.
#[derive(Debug, Serialize)]
pub struct WebhookDeliveryResponse {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event_type: WebhookEventType,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub response_status: Option<i32>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

impl From<&WebhookDelivery> for WebhookDeliveryResponse {
    fn from(d: &WebhookDelivery) -> Self {
        WebhookDeliveryResponse {
            id: d.id,
            webhook_id: d.webhook_id,
            event_type: d.event_type,
            status: d.status,
            attempts: d.attempts,
            created_at: d.created_at,
            delivered_at: d.delivered_at,
            response_status: d.response_status,
            error: d.error.clone(),
            duration_ms: d.duration_ms,
        }
    }
}

/// Wire payload posted to subscriber endpoints. `created_at` doubles as the
/// replay-protection timestamp receivers validate against a tolerance window.
#[derive(Debug, Serialize)]
pub struct WebhookPayload {
    pub id: Uuid,
    pub event: WebhookEventType,
    pub created_at: String,
    pub data: serde_json::Value,
}
