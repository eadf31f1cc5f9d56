use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::applications::handlers::user_id;
use crate::errors::AppError;
use crate::models::webhook::{
    WebhookCreate, WebhookDeliveryResponse, WebhookResponse, WebhookWithSecret,
};
use crate::state::AppState;

pub async fn handle_create_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<WebhookCreate>,
) -> Result<(StatusCode, Json<WebhookWithSecret>), AppError> {
    let user = user_id(&headers)?;
    let webhook = state.webhooks.create_webhook(&user, request).await?;
    let response = WebhookWithSecret {
        webhook: WebhookResponse::from(&webhook),
        secret: webhook.secret.clone(),
    };
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn handle_list_webhooks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<WebhookResponse>>, AppError> {
    let user = user_id(&headers)?;
    let webhooks = state.webhooks.list_webhooks(&user).await?;
    Ok(Json(webhooks.iter().map(WebhookResponse::from).collect()))
}

pub async fn handle_get_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<WebhookResponse>, AppError> {
    let user = user_id(&headers)?;
    let webhook = state
        .webhooks
        .get_webhook(id, &user)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Webhook {id} not found")))?;
    Ok(Json(WebhookResponse::from(&webhook)))
}

pub async fn handle_delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let user = user_id(&headers)?;
    if state.webhooks.delete_webhook(id, &user).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Webhook {id} not found")))
    }
}

/// Operator action: re-enable an auto-disabled subscription.
pub async fn handle_enable_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<WebhookResponse>, AppError> {
    let user = user_id(&headers)?;
    if !state.webhooks.enable_webhook(id, &user).await? {
        return Err(AppError::NotFound(format!("Webhook {id} not found")));
    }
    let webhook = state
        .webhooks
        .get_webhook(id, &user)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Webhook {id} not found")))?;
    Ok(Json(WebhookResponse::from(&webhook)))
}

#[derive(Debug, Deserialize)]
pub struct DeliveryListParams {
    #[serde(default = "default_delivery_limit")]
    pub limit: i64,
}

fn default_delivery_limit() -> i64 {
    50
}

pub async fn handle_list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<DeliveryListParams>,
    headers: HeaderMap,
) -> Result<Json<Vec<WebhookDeliveryResponse>>, AppError> {
    let user = user_id(&headers)?;
    state
        .webhooks
        .get_webhook(id, &user)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Webhook {id} not found")))?;
    let deliveries = state
        .webhooks
        .list_deliveries(id, &user, params.limit.clamp(1, 200))
        .await?;
    Ok(Json(
        deliveries.iter().map(WebhookDeliveryResponse::from).collect(),
    ))
}

#[derive(Debug, Serialize)]
pub struct WebhookTestResponse {
    pub success: bool,
    pub delivery_id: Uuid,
    pub response_status: Option<i32>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

/// Fires a synthetic event at the subscription and reports the outcome.
pub async fn handle_test_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<WebhookTestResponse>, AppError> {
    let user = user_id(&headers)?;
    let webhook = state
        .webhooks
        .get_webhook(id, &user)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Webhook {id} not found")))?;

    let delivery_id = state.webhooks.create_test_delivery(&webhook).await?;
    let delivery = state
        .delivery
        .deliver_now(delivery_id)
        .await?
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("test delivery vanished")))?;

    Ok(Json(WebhookTestResponse {
        success: matches!(
            delivery.status,
            crate::models::webhook::DeliveryStatus::Delivered
        ),
        delivery_id,
        response_status: delivery.response_status,
        duration_ms: delivery.duration_ms,
        error: delivery.error,
    }))
}
