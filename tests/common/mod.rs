#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use image::DynamicImage;

use pollinator_pipeline::clients::ObjectStore;
use pollinator_pipeline::models::{InferenceConfig, ModelParams, PipelineError, Result};
use pollinator_pipeline::processing::{Detection, DetectionModel};

/// In-memory object store for pipeline tests.
pub struct InMemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new(objects: HashMap<String, Vec<u8>>) -> Self {
        Self {
            objects: Mutex::new(objects),
        }
    }

    pub fn contains(&self, object_name: &str) -> bool {
        self.objects.lock().unwrap().contains_key(object_name)
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn list(&self, _bucket: &str, prefix: &str, _recursive: bool) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get(&self, _bucket: &str, object_name: &str, dest: &Path) -> Result<()> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(object_name)
            .cloned()
            .ok_or_else(|| PipelineError::ObjectStore(format!("object not found: {}", object_name)))?;
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }

    async fn put(&self, _bucket: &str, object_name: &str, src: &Path) -> Result<()> {
        let bytes = tokio::fs::read(src).await?;
        self.objects
            .lock()
            .unwrap()
            .insert(object_name.to_string(), bytes);
        Ok(())
    }
}

/// Detection model driven by a closure, for scripting cascade scenarios.
pub struct ScriptedModel<F>
where
    F: FnMut(&DynamicImage) -> Result<Vec<Detection>> + Send,
{
    script: F,
}

impl<F> ScriptedModel<F>
where
    F: FnMut(&DynamicImage) -> Result<Vec<Detection>> + Send,
{
    pub fn new(script: F) -> Self {
        Self { script }
    }
}

impl<F> DetectionModel for ScriptedModel<F>
where
    F: FnMut(&DynamicImage) -> Result<Vec<Detection>> + Send,
{
    fn predict(&mut self, image: &DynamicImage) -> Result<Vec<Detection>> {
        (self.script)(image)
    }
}

/// Encodes a solid image as PNG bytes.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::new_rgb8(width, height);
    let mut bytes = Vec::new();
    img.write_to(
        &mut std::io::Cursor::new(&mut bytes),
        image::ImageOutputFormat::Png,
    )
    .expect("png encoding");
    bytes
}

pub fn scratch_dir() -> PathBuf {
    std::env::temp_dir()
        .join("pollinator-pipeline-tests")
        .join(uuid::Uuid::new_v4().to_string())
}

pub fn sample_params(weights: &str) -> ModelParams {
    ModelParams {
        weights_path: weights.to_string(),
        class_names: vec!["daisy".to_string(), "flockenblume".to_string()],
        confidence_threshold: 0.4,
        iou_threshold: 0.45,
        margin: 40,
        multi_label: false,
        multi_label_iou_threshold: 0.7,
        max_detections: 20,
        augment: false,
        image_size: 640,
    }
}

pub fn sample_config(config_id: &str) -> InferenceConfig {
    InferenceConfig {
        config_id: config_id.to_string(),
        flower: sample_params("models/flower.onnx"),
        pollinator: ModelParams {
            weights_path: "models/pollinator.onnx".to_string(),
            class_names: vec!["honigbiene".to_string(), "hummel".to_string()],
            margin: 0,
            ..sample_params("models/pollinator.onnx")
        },
    }
}
