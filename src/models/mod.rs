pub mod detection;
pub mod model_config;
pub mod record;

pub use detection::*;
pub use model_config::*;
pub use record::*;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Checkpoint query failed: {0}")]
    DataAccess(String),

    #[error("No unprocessed images left for this configuration")]
    Exhausted,

    #[error("Fetch failed for {object}: {reason}")]
    FetchItem { object: String, reason: String },

    #[error("Inference failed for {object}: {reason}")]
    InferenceItem { object: String, reason: String },

    #[error("No flower row matches pollinator detection {object}#{flower_box_id}")]
    UnresolvedJoin { object: String, flower_box_id: usize },

    #[error("Load error: {0}")]
    Load(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
