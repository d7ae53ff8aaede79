use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `files` catalog: one entry per object ingested into the
/// bucket. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImageRecord {
    pub file_id: i64,
    pub object_name: String,
}
