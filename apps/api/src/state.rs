use std::sync::Arc;

use crate::applications::producer::SubmissionProducer;
use crate::applications::resume::ResumeStore;
use crate::applications::store::ApplicationStore;
use crate::cache::CacheLayer;
use crate::config::Config;
use crate::events::EventBus;
use crate::queue::QueueTransport;
use crate::webhooks::delivery::DeliveryWorker;
use crate::webhooks::service::WebhookService;

/// Shared application state injected into all route handlers via Axum
/// extractors. The trait objects are the substitution seams: Postgres-backed
/// implementations in production, in-memory ones in tests.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ApplicationStore>,
    pub queue: Arc<dyn QueueTransport>,
    pub producer: Arc<SubmissionProducer>,
    pub resumes: Arc<ResumeStore>,
    pub cache: Arc<CacheLayer>,
    pub webhooks: WebhookService,
    pub delivery: Arc<DeliveryWorker>,
    /// Event stream surface, reserved for a real-time notification layer
    /// (the webhook dispatcher holds its own subscription).
    #[allow(dead_code)]
    pub events: EventBus,
}
