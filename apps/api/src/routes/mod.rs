pub mod admin;
pub mod health;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::applications::handlers as applications;
use crate::state::AppState;
use crate::webhooks::handlers as webhooks;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Applications
        .route("/api/v1/applications", post(applications::handle_submit))
        .route(
            "/api/v1/applications/:id/status",
            get(applications::handle_status),
        )
        // Webhook subscriptions
        .route(
            "/api/v1/webhooks",
            post(webhooks::handle_create_webhook).get(webhooks::handle_list_webhooks),
        )
        .route(
            "/api/v1/webhooks/:id",
            get(webhooks::handle_get_webhook).delete(webhooks::handle_delete_webhook),
        )
        .route(
            "/api/v1/webhooks/:id/enable",
            post(webhooks::handle_enable_webhook),
        )
        .route(
            "/api/v1/webhooks/:id/deliveries",
            get(webhooks::handle_list_deliveries),
        )
        .route(
            "/api/v1/webhooks/:id/test",
            post(webhooks::handle_test_webhook),
        )
        // Admin
        .route("/admin/queue", get(admin::handle_queue_depths))
        .route("/admin/dlq", get(admin::handle_list_dead_letters))
        .route(
            "/admin/dlq/:id/requeue",
            post(admin::handle_requeue_dead_letter),
        )
        .route("/admin/dlq/:id", delete(admin::handle_discard_dead_letter))
        .with_state(state)
}
