use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::debug;
use uuid::Uuid;

use crate::cache::CacheKey;
use crate::errors::AppError;
use crate::models::application::{ApplicationStatusResponse, JobData};
use crate::rate_limit::RateDecision;
use crate::state::AppState;

use super::producer::{SubmissionRequest, SubmitOutcome};

/// Authentication is an external collaborator; the request layer forwards
/// the verified identity in this header.
const USER_ID_HEADER: &str = "X-User-Id";
const IDEMPOTENCY_KEY_HEADER: &str = "X-Idempotency-Key";

pub(crate) fn user_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(AppError::Unauthorized)
}

/// `POST /api/v1/applications`: multipart submission with a `jobs` JSON
/// field and an optional `cv` file.
pub async fn handle_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let user = user_id(&headers)?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut jobs: Option<Vec<JobData>> = None;
    let mut cv: Option<bytes::Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Invalid multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("jobs") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("Unreadable jobs field: {e}")))?;
                jobs = Some(serde_json::from_str(&raw).map_err(|e| {
                    AppError::Validation(format!("jobs must be a JSON array of job objects: {e}"))
                })?);
            }
            Some("cv") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("Unreadable cv upload: {e}")))?;
                if !data.is_empty() {
                    cv = Some(data);
                }
            }
            _ => {}
        }
    }

    let jobs = jobs.ok_or_else(|| AppError::Validation("Missing 'jobs' field".to_string()))?;

    let resume_id = match cv {
        Some(data) => Some(state.resumes.store(&user, &data).await?),
        None => None,
    };

    let outcome = state
        .producer
        .submit(
            &user,
            SubmissionRequest { jobs, resume_id },
            idempotency_key.as_deref(),
        )
        .await?;

    match outcome {
        SubmitOutcome::Accepted { receipt, rate } => {
            let mut response = (StatusCode::ACCEPTED, Json(receipt)).into_response();
            if let Some(RateDecision::Allowed {
                remaining,
                reset_at,
            }) = rate
            {
                let headers = response.headers_mut();
                let limit = state.config.rate_limit_max_requests;
                if let Ok(v) = limit.to_string().parse() {
                    headers.insert("X-RateLimit-Limit", v);
                }
                if let Ok(v) = remaining.to_string().parse() {
                    headers.insert("X-RateLimit-Remaining", v);
                }
                if let Ok(v) = reset_at.timestamp().to_string().parse() {
                    headers.insert("X-RateLimit-Reset", v);
                }
            }
            Ok(response)
        }
        SubmitOutcome::Replayed { response } => {
            let mut response = (StatusCode::ACCEPTED, Json(response)).into_response();
            response
                .headers_mut()
                .insert("X-Idempotency-Replayed", "true".parse().expect("static header"));
            Ok(response)
        }
    }
}

/// `GET /api/v1/applications/:id/status`: the status query surface,
/// cache-assisted on the hot path.
pub async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApplicationStatusResponse>, AppError> {
    let user = user_id(&headers)?;
    let cache_key = CacheKey::application_status(&user, id);

    if let Some(cached) = state.cache.get(&cache_key).await {
        if let Ok(response) = serde_json::from_str::<ApplicationStatusResponse>(&cached) {
            debug!(application_id = %id, "status served from cache");
            return Ok(Json(response));
        }
        // Unparseable entry: drop it and fall through to the store.
        state.cache.delete(&cache_key).await;
    }

    let app = state
        .store
        .fetch_for_user(id, &user)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Application {id} not found")))?;
    let response = ApplicationStatusResponse::from(&app);

    if let Ok(serialized) = serde_json::to_string(&response) {
        state
            .cache
            .set(&cache_key, &serialized, state.cache.default_ttl())
            .await;
    }

    Ok(Json(response))
}
