//! Durable record of each application's state and timestamps.
//!
//! The store is the single source of truth for application state. All
//! transitions are guarded conditional writes: a terminal row is never
//! updated again, no matter how often a message is redelivered.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::application::{Application, ApplicationStatus, JobData};

/// Result of asking for the pending -> processing transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingAdmission {
    /// The application is now `processing` (either freshly transitioned, or
    /// a crashed attempt being resumed after redelivery).
    Admitted,
    /// The application already reached a terminal state; the message is a
    /// stale redelivery and must be dropped without side effects.
    Terminal(ApplicationStatus),
}

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn create(&self, app: &Application) -> Result<(), AppError>;

    async fn fetch(&self, id: Uuid) -> Result<Option<Application>, AppError>;

    async fn fetch_for_user(
        &self,
        id: Uuid,
        user_id: &str,
    ) -> Result<Option<Application>, AppError>;

    /// Moves a pending application to `processing`. Idempotent under
    /// redelivery: an already-`processing` row is admitted again, a terminal
    /// row is reported as such.
    async fn begin_processing(&self, id: Uuid) -> Result<ProcessingAdmission, AppError>;

    /// Moves an application to a terminal state, stamping `processed_at` and,
    /// for failures, `error_reason`. Returns false if the row was already
    /// terminal (the transition did not happen again).
    async fn finish(
        &self,
        id: Uuid,
        status: ApplicationStatus,
        error_reason: Option<&str>,
    ) -> Result<bool, AppError>;
}

pub struct PgApplicationStore {
    pool: PgPool,
}

impl PgApplicationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type ApplicationRow = (
    Uuid,
    String,
    Json<Vec<JobData>>,
    i32,
    String,
    Option<Uuid>,
    chrono::DateTime<Utc>,
    chrono::DateTime<Utc>,
    Option<chrono::DateTime<Utc>>,
    Option<String>,
);

fn row_to_application(row: ApplicationRow) -> Result<Application, AppError> {
    let (id, user_id, jobs, job_count, status, resume_id, created_at, updated_at, processed_at, error_reason) =
        row;
    let status = ApplicationStatus::parse(&status)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown application status '{status}'")))?;
    Ok(Application {
        id,
        user_id,
        jobs: jobs.0,
        job_count,
        status,
        resume_id,
        created_at,
        updated_at,
        processed_at,
        error_reason,
    })
}

const SELECT_APPLICATION: &str = "SELECT id, user_id, jobs, job_count, status, resume_id, \
     created_at, updated_at, processed_at, error_reason FROM applications";

#[async_trait]
impl ApplicationStore for PgApplicationStore {
    async fn create(&self, app: &Application) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO applications
                (id, user_id, jobs, job_count, status, resume_id,
                 created_at, updated_at, processed_at, error_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, NULL)
            "#,
        )
        .bind(app.id)
        .bind(&app.user_id)
        .bind(Json(&app.jobs))
        .bind(app.job_count)
        .bind(app.status.as_str())
        .bind(app.resume_id)
        .bind(app.created_at)
        .bind(app.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Application>, AppError> {
        let row: Option<ApplicationRow> =
            sqlx::query_as(&format!("{SELECT_APPLICATION} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_application).transpose()
    }

    async fn fetch_for_user(
        &self,
        id: Uuid,
        user_id: &str,
    ) -> Result<Option<Application>, AppError> {
        let row: Option<ApplicationRow> =
            sqlx::query_as(&format!("{SELECT_APPLICATION} WHERE id = $1 AND user_id = $2"))
                .bind(id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_application).transpose()
    }

    async fn begin_processing(&self, id: Uuid) -> Result<ProcessingAdmission, AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE applications
            SET status = 'processing', updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(ProcessingAdmission::Admitted);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM applications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let status = status
            .as_deref()
            .and_then(ApplicationStatus::parse)
            .ok_or_else(|| AppError::NotFound(format!("Application {id} not found")))?;
        Ok(ProcessingAdmission::Terminal(status))
    }

    async fn finish(
        &self,
        id: Uuid,
        status: ApplicationStatus,
        error_reason: Option<&str>,
    ) -> Result<bool, AppError> {
        debug_assert!(status.is_terminal());
        let updated = sqlx::query(
            r#"
            UPDATE applications
            SET status = $2, updated_at = NOW(), processed_at = NOW(), error_reason = $3
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_reason)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }
}

/// In-memory store used by the pipeline's unit and scenario tests in place of
/// PostgreSQL. Implements the same guarded transitions.
#[derive(Default)]
#[allow(dead_code)]
pub struct InMemoryApplicationStore {
    rows: Mutex<HashMap<Uuid, Application>>,
}

impl InMemoryApplicationStore {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApplicationStore for InMemoryApplicationStore {
    async fn create(&self, app: &Application) -> Result<(), AppError> {
        let mut rows = self.rows.lock().expect("application map poisoned");
        rows.insert(app.id, app.clone());
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Application>, AppError> {
        let rows = self.rows.lock().expect("application map poisoned");
        Ok(rows.get(&id).cloned())
    }

    async fn fetch_for_user(
        &self,
        id: Uuid,
        user_id: &str,
    ) -> Result<Option<Application>, AppError> {
        let rows = self.rows.lock().expect("application map poisoned");
        Ok(rows.get(&id).filter(|a| a.user_id == user_id).cloned())
    }

    async fn begin_processing(&self, id: Uuid) -> Result<ProcessingAdmission, AppError> {
        let mut rows = self.rows.lock().expect("application map poisoned");
        let app = rows
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Application {id} not found")))?;

        if app.status.is_terminal() {
            return Ok(ProcessingAdmission::Terminal(app.status));
        }
        app.status = ApplicationStatus::Processing;
        app.updated_at = Utc::now();
        Ok(ProcessingAdmission::Admitted)
    }

    async fn finish(
        &self,
        id: Uuid,
        status: ApplicationStatus,
        error_reason: Option<&str>,
    ) -> Result<bool, AppError> {
        debug_assert!(status.is_terminal());
        let mut rows = self.rows.lock().expect("application map poisoned");
        let Some(app) = rows.get_mut(&id) else {
            return Ok(false);
        };
        if app.status.is_terminal() {
            return Ok(false);
        }
        let now = Utc::now();
        app.status = status;
        app.updated_at = now;
        app.processed_at = Some(now);
        app.error_reason = error_reason.map(str::to_string);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::application::JobData;

    fn pending_app() -> Application {
        let now = Utc::now();
        Application {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            jobs: vec![JobData {
                title: "Backend Engineer".to_string(),
                portal: Some("linkedin".to_string()),
                company: Some("Initech".to_string()),
                description: None,
            }],
            job_count: 1,
            status: ApplicationStatus::Pending,
            resume_id: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            error_reason: None,
        }
    }

    #[tokio::test]
    async fn test_terminal_rows_are_never_updated_again() {
        let store = InMemoryApplicationStore::new();
        let app = pending_app();
        store.create(&app).await.unwrap();

        store.begin_processing(app.id).await.unwrap();
        assert!(store
            .finish(app.id, ApplicationStatus::Success, None)
            .await
            .unwrap());

        // Redelivery after the terminal transition: admission reports
        // terminal, and a second finish is a no-op.
        assert_eq!(
            store.begin_processing(app.id).await.unwrap(),
            ProcessingAdmission::Terminal(ApplicationStatus::Success)
        );
        assert!(!store
            .finish(app.id, ApplicationStatus::Failed, Some("late"))
            .await
            .unwrap());

        let stored = store.fetch(app.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ApplicationStatus::Success);
        assert!(stored.error_reason.is_none());
    }

    #[tokio::test]
    async fn test_processed_at_set_iff_terminal_and_error_reason_iff_failed() {
        let store = InMemoryApplicationStore::new();
        let app = pending_app();
        store.create(&app).await.unwrap();

        let stored = store.fetch(app.id).await.unwrap().unwrap();
        assert!(stored.processed_at.is_none());

        store.begin_processing(app.id).await.unwrap();
        let stored = store.fetch(app.id).await.unwrap().unwrap();
        assert!(stored.processed_at.is_none());
        assert!(stored.error_reason.is_none());

        store
            .finish(app.id, ApplicationStatus::Failed, Some("portal rejected the posting"))
            .await
            .unwrap();
        let stored = store.fetch(app.id).await.unwrap().unwrap();
        assert!(stored.processed_at.is_some());
        assert_eq!(
            stored.error_reason.as_deref(),
            Some("portal rejected the posting")
        );
    }

    #[tokio::test]
    async fn test_fetch_for_user_enforces_ownership() {
        let store = InMemoryApplicationStore::new();
        let app = pending_app();
        store.create(&app).await.unwrap();

        assert!(store.fetch_for_user(app.id, "u1").await.unwrap().is_some());
        assert!(store.fetch_for_user(app.id, "u2").await.unwrap().is_none());
    }
}
