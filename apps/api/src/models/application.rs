use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of an application batch.
///
/// Lifecycle: pending -> processing -> success/failed. Terminal states are
/// never left; only the processing worker moves an application forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Processing => "processing",
            ApplicationStatus::Success => "success",
            ApplicationStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ApplicationStatus::Pending),
            "processing" => Some(ApplicationStatus::Processing),
            "success" => Some(ApplicationStatus::Success),
            "failed" => Some(ApplicationStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ApplicationStatus::Success | ApplicationStatus::Failed)
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One job descriptor inside a submission. Opaque to the pipeline beyond the
/// fields listed here; the processing step decides what to do with them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    pub title: String,
    pub portal: Option<String>,
    pub company: Option<String>,
    pub description: Option<String>,
}

/// A submitted batch of job applications tracked through the pipeline.
#[derive(Debug, Clone)]
pub struct Application {
    pub id: Uuid,
    pub user_id: String,
    pub jobs: Vec<JobData>,
    pub job_count: i32,
    pub status: ApplicationStatus,
    pub resume_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
}

/// Receipt returned to the submitter immediately after the durable write and
/// queue publish. Processing completion is never awaited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub application_id: Uuid,
    pub status: ApplicationStatus,
    pub job_count: i32,
    pub status_url: String,
    pub created_at: DateTime<Utc>,
}

/// Response for status queries; also the shape cached on the read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationStatusResponse {
    pub application_id: Uuid,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub job_count: i32,
    pub error_reason: Option<String>,
}

impl From<&Application> for ApplicationStatusResponse {
    fn from(app: &Application) -> Self {
        ApplicationStatusResponse {
            application_id: app.id,
            status: app.status,
            created_at: app.created_at,
            updated_at: app.updated_at,
            processed_at: app.processed_at,
            job_count: app.job_count,
            error_reason: app.error_reason.clone(),
        }
    }
}
