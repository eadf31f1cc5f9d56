use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::application::ApplicationStatus;
use crate::models::webhook::WebhookEventType;

/// Schema version stamped into every event payload so downstream consumers
/// can track compatibility.
pub const EVENT_SCHEMA_VERSION: &str = "1.0";

/// Emitted whenever an application enters a new state. The submission
/// producer emits the initial `pending` event; every later transition comes
/// from the processing worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangedEvent {
    pub application_id: Uuid,
    pub user_id: String,
    pub status: ApplicationStatus,
    pub previous_status: Option<ApplicationStatus>,
    pub job_count: i32,
    pub error_reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl StatusChangedEvent {
    /// The webhook event type this transition maps to.
    pub fn event_type(&self) -> WebhookEventType {
        match self.status {
            ApplicationStatus::Pending => WebhookEventType::ApplicationSubmitted,
            ApplicationStatus::Processing => WebhookEventType::ApplicationProcessing,
            ApplicationStatus::Success => WebhookEventType::ApplicationCompleted,
            ApplicationStatus::Failed => WebhookEventType::ApplicationFailed,
        }
    }

    /// Minimal application fields exposed to subscribers. Resume content is
    /// never included.
    pub fn payload_data(&self) -> serde_json::Value {
        let mut data = json!({
            "version": EVENT_SCHEMA_VERSION,
            "application_id": self.application_id,
            "user_id": self.user_id,
            "status": self.status,
            "job_count": self.job_count,
            "timestamp": self.occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        if let Some(previous) = self.previous_status {
            data["previous_status"] = json!(previous);
        }
        if let Some(reason) = &self.error_reason {
            data["error_reason"] = json!(reason);
        }
        data
    }
}

/// In-process fan-out of status-changed events. The webhook dispatcher holds
/// one receiver; additional real-time notification layers may hold more.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StatusChangedEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChangedEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. A send with no live receivers is not an error;
    /// the status store remains the source of truth either way.
    pub fn emit(&self, event: StatusChangedEvent) {
        tracing::debug!(
            application_id = %event.application_id,
            status = %event.status,
            "emitting status-changed event"
        );
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}
