use sqlx::PgPool;

use crate::models::{FlowerRow, InferenceConfig, PipelineError, PollinatorRow, Result};

/// Sole writer of `inference_config`, `image_results`, `flowers` and
/// `pollinators`. Every operation runs in its own transaction: commit on
/// success, rollback (by drop) on error — a failed batch leaves no partial
/// rows behind.
pub struct Loader {
    pool: PgPool,
}

impl Loader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts the configuration unless an identical document is already
    /// stored. A reused `config_id` carrying different content is rejected:
    /// configurations are immutable once persisted.
    pub async fn upsert_config(&self, config: &InferenceConfig) -> Result<()> {
        let document = config.as_value()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PipelineError::Load(format!("could not open transaction: {}", e)))?;

        let existing: Vec<(String, serde_json::Value)> =
            sqlx::query_as("SELECT config_id, configuration FROM inference_config")
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| PipelineError::Load(format!("could not read configurations: {}", e)))?;

        if existing.iter().any(|(_, stored)| *stored == document) {
            tracing::debug!(config_id = %config.config_id, "Model configuration already stored; skipping insert");
            return Ok(());
        }
        if existing.iter().any(|(id, _)| id == &config.config_id) {
            return Err(PipelineError::Load(format!(
                "config_id {} already exists with different content",
                config.config_id
            )));
        }

        sqlx::query("INSERT INTO inference_config (config_id, configuration) VALUES ($1, $2)")
            .bind(&config.config_id)
            .bind(&document)
            .execute(&mut *tx)
            .await
            .map_err(|e| PipelineError::Load(format!("could not insert configuration: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| PipelineError::Load(format!("could not commit configuration: {}", e)))?;

        tracing::info!(config_id = %config.config_id, "Stored model configuration");
        Ok(())
    }

    /// Creates one `image_results` row per file and returns the generated ids
    /// positionally aligned with the input. With `allow_multiple = false` an
    /// already-present `(file_id, config_id)` pair is skipped and yields
    /// `None` at its position; with `allow_multiple = true` rows accumulate
    /// unconditionally.
    pub async fn insert_results(
        &self,
        file_ids: &[i64],
        config_id: &str,
        allow_multiple: bool,
    ) -> Result<Vec<Option<i64>>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PipelineError::Load(format!("could not open transaction: {}", e)))?;

        let mut result_ids = Vec::with_capacity(file_ids.len());
        for &file_id in file_ids {
            let row: Option<(i64,)> = if allow_multiple {
                let inserted: (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO image_results (file_id, config_id)
                    VALUES ($1, $2)
                    RETURNING result_id
                    "#,
                )
                .bind(file_id)
                .bind(config_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    PipelineError::Load(format!("could not insert result for file {}: {}", file_id, e))
                })?;
                Some(inserted)
            } else {
                sqlx::query_as(
                    r#"
                    INSERT INTO image_results (file_id, config_id)
                    SELECT $1, $2
                    WHERE NOT EXISTS (
                        SELECT 1 FROM image_results
                        WHERE file_id = $1 AND config_id = $2
                    )
                    RETURNING result_id
                    "#,
                )
                .bind(file_id)
                .bind(config_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| {
                    PipelineError::Load(format!("could not insert result for file {}: {}", file_id, e))
                })?
            };
            result_ids.push(row.map(|(id,)| id));
        }

        tx.commit()
            .await
            .map_err(|e| PipelineError::Load(format!("could not commit results: {}", e)))?;

        let inserted = result_ids.iter().filter(|id| id.is_some()).count();
        tracing::info!(
            config_id = %config_id,
            inserted,
            skipped = file_ids.len() - inserted,
            "Inserted image results"
        );
        Ok(result_ids)
    }

    /// Inserts flower rows, returning the generated `flower_id`s in input
    /// order. All-or-nothing per batch.
    pub async fn insert_flowers(&self, rows: &[FlowerRow]) -> Result<Vec<i64>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PipelineError::Load(format!("could not open transaction: {}", e)))?;

        let mut flower_ids = Vec::with_capacity(rows.len());
        for row in rows {
            let (flower_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO flowers (result_id, class, confidence, x0, y0, x1, y1)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING flower_id
                "#,
            )
            .bind(row.result_id)
            .bind(&row.class_name)
            .bind(row.confidence)
            .bind(row.x0)
            .bind(row.y0)
            .bind(row.x1)
            .bind(row.y1)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| PipelineError::Load(format!("could not insert flower row: {}", e)))?;
            flower_ids.push(flower_id);
        }

        tx.commit()
            .await
            .map_err(|e| PipelineError::Load(format!("could not commit flower rows: {}", e)))?;

        tracing::info!(rows = flower_ids.len(), "Inserted flower rows");
        Ok(flower_ids)
    }

    /// Inserts pollinator rows. No generated ids are surfaced; nothing joins
    /// on them downstream. All-or-nothing per batch.
    pub async fn insert_pollinators(&self, rows: &[PollinatorRow]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PipelineError::Load(format!("could not open transaction: {}", e)))?;

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO pollinators (result_id, flower_id, class, confidence, x0, y0, x1, y1)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(row.result_id)
            .bind(row.flower_id)
            .bind(&row.class_name)
            .bind(row.confidence)
            .bind(row.x0)
            .bind(row.y0)
            .bind(row.x1)
            .bind(row.y1)
            .execute(&mut *tx)
            .await
            .map_err(|e| PipelineError::Load(format!("could not insert pollinator row: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| PipelineError::Load(format!("could not commit pollinator rows: {}", e)))?;

        tracing::info!(rows = rows.len(), "Inserted pollinator rows");
        Ok(())
    }
}
