use sqlx::PgPool;

use crate::models::{ImageRecord, PipelineError, Result};

/// Computes the next unprocessed batch of images for a model configuration:
/// catalog entries with no `image_results` row for that `config_id`, in
/// ascending `file_id` order so batches are reproducible and coverage is
/// eventually complete.
pub struct Checkpointer {
    pool: PgPool,
}

impl Checkpointer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns at most `batch_size` records. An empty checkpoint is reported
    /// as `PipelineError::Exhausted`, which callers must treat as "nothing to
    /// do" rather than a failure.
    pub async fn get_batch(&self, config_id: &str, batch_size: i64) -> Result<Vec<ImageRecord>> {
        let records: Vec<ImageRecord> = sqlx::query_as(
            r#"
            SELECT f.file_id, f.object_name
            FROM files f
            WHERE NOT EXISTS (
                SELECT 1
                FROM image_results r
                WHERE r.file_id = f.file_id AND r.config_id = $1
            )
            ORDER BY f.file_id ASC
            LIMIT $2
            "#,
        )
        .bind(config_id)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::DataAccess(e.to_string()))?;

        if records.is_empty() {
            return Err(PipelineError::Exhausted);
        }

        tracing::info!(
            config_id = %config_id,
            batch = records.len(),
            first_file_id = records[0].file_id,
            "Checkpoint computed"
        );
        Ok(records)
    }
}
