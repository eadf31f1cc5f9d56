use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;

/// Storage for uploaded resume artifacts. The pipeline treats the content as
/// opaque bytes; only the id travels with the application.
pub struct ResumeStore {
    pool: PgPool,
}

impl ResumeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn store(&self, user_id: &str, data: &[u8]) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO resumes (id, user_id, data, created_at) VALUES ($1, $2, $3, NOW())",
        )
        .bind(id)
        .bind(user_id)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }
}
