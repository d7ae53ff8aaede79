use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{PipelineError, Result};

/// Parameters for one detector stage. The full document (both stages plus
/// `config_id`) is what gets persisted to `inference_config` and what defines
/// result identity for checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub weights_path: String,
    pub class_names: Vec<String>,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub margin: i32,
    pub multi_label: bool,
    pub multi_label_iou_threshold: f32,
    pub max_detections: usize,
    #[serde(default)]
    pub augment: bool,
    pub image_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub config_id: String,
    pub flower: ModelParams,
    pub pollinator: ModelParams,
}

impl InferenceConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config: InferenceConfig = serde_json::from_str(&raw)?;
        // Hand-edited documents sometimes carry a trailing newline in the id.
        config.config_id = config.config_id.trim().to_string();
        if config.config_id.is_empty() {
            return Err(PipelineError::Configuration(
                "model configuration has an empty config_id".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn as_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Short content fingerprint for log correlation.
    pub fn fingerprint(&self) -> Result<String> {
        let serialized = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&serialized);
        Ok(format!("{:x}", digest)[..16].to_string())
    }
}
