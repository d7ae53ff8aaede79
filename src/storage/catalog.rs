use sqlx::PgPool;

use crate::models::Result;

/// Registration side of the `files` catalog: makes scanned bucket objects
/// visible to the checkpointer. Existing entries are left untouched.
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts object names not yet present, returning the number of new
    /// rows.
    pub async fn register_objects(&self, object_names: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let mut inserted = 0;
        for object_name in object_names {
            let result =
                sqlx::query("INSERT INTO files (object_name) VALUES ($1) ON CONFLICT (object_name) DO NOTHING")
                    .bind(object_name)
                    .execute(&mut *tx)
                    .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        tracing::info!(
            scanned = object_names.len(),
            registered = inserted,
            "Catalog registration finished"
        );
        Ok(inserted)
    }
}
