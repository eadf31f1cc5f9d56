use async_trait::async_trait;
use tracing::info;

use super::retry::ProcessingError;
use crate::models::application::Application;

/// The job-specific processing step, opaque to the pipeline. Implementations
/// classify their own failures via [`ProcessingError`]; the worker's retry
/// handling depends on nothing else.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, application: &Application) -> Result<(), ProcessingError>;
}

/// Default processor: validates the batch and walks each job descriptor.
// TODO: replace the per-job walk with real portal submission (tailored
// document generation + form fill) once the portal adapters land.
pub struct PortalSubmitter;

#[async_trait]
impl JobProcessor for PortalSubmitter {
    async fn process(&self, application: &Application) -> Result<(), ProcessingError> {
        if application.jobs.is_empty() {
            return Err(ProcessingError::NonRetryable(
                "application contains no jobs".to_string(),
            ));
        }

        for job in &application.jobs {
            if job.title.trim().is_empty() {
                return Err(ProcessingError::NonRetryable(
                    "job descriptor is missing a title".to_string(),
                ));
            }
            info!(
                application_id = %application.id,
                title = %job.title,
                portal = job.portal.as_deref().unwrap_or("unknown"),
                "submitting job application"
            );
        }

        Ok(())
    }
}
