use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use image::GenericImageView;

use crate::models::{FlowerDetectionDraft, ImageRecord, PipelineError, PollinatorDetectionDraft};
use crate::processing::detector::DetectionModel;

/// One image of the batch, materialized locally by the fetch stage.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub record: ImageRecord,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct InferenceOutput {
    pub flower_drafts: Vec<FlowerDetectionDraft>,
    pub pollinator_drafts: Vec<PollinatorDetectionDraft>,
    /// Images that went through both stages.
    pub processed: usize,
    /// One `InferenceItem` error per image skipped by per-item recovery.
    pub skipped: Vec<PipelineError>,
}

/// Runs the two-stage cascade sequentially over a batch. Per-image failures
/// (unreadable file, flower-model error) skip that image; per-crop pollinator
/// failures skip that crop. Neither aborts the batch.
pub struct InferencePipeline {
    progress: Arc<AtomicU64>,
    cancel: Arc<AtomicBool>,
}

impl InferencePipeline {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            progress: Arc::new(AtomicU64::new(0)),
            cancel,
        }
    }

    /// Monotonically advancing count of images handled so far in the current
    /// run, for external progress reporting.
    pub fn progress(&self) -> Arc<AtomicU64> {
        self.progress.clone()
    }

    pub fn run(
        &self,
        batch: &[BatchItem],
        flower_model: &mut dyn DetectionModel,
        pollinator_model: &mut dyn DetectionModel,
    ) -> InferenceOutput {
        self.progress.store(0, Ordering::Relaxed);
        let mut output = InferenceOutput::default();

        for item in batch {
            if self.cancel.load(Ordering::Relaxed) {
                tracing::warn!(
                    remaining = batch.len() as u64 - self.progress.load(Ordering::Relaxed),
                    "Cancellation requested; stopping inference between images"
                );
                break;
            }

            let object_name = item.record.object_name.as_str();
            let img = match image::open(&item.path) {
                Ok(img) => img,
                Err(e) => {
                    tracing::warn!(object = %object_name, error = %e, "Could not load image; skipping");
                    output.skipped.push(PipelineError::InferenceItem {
                        object: object_name.to_string(),
                        reason: format!("load failed: {}", e),
                    });
                    self.progress.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let (width, height) = img.dimensions();
            tracing::debug!(object = %object_name, width, height, "Running flower detection");

            let flowers = match flower_model.predict(&img) {
                Ok(flowers) => flowers,
                Err(e) => {
                    tracing::warn!(object = %object_name, error = %e, "Flower inference failed; skipping image");
                    output.skipped.push(PipelineError::InferenceItem {
                        object: object_name.to_string(),
                        reason: format!("flower inference failed: {}", e),
                    });
                    self.progress.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            for (flower_index, flower) in flowers.iter().enumerate() {
                let (crop_width, crop_height) = flower.crop.dimensions();
                output.flower_drafts.push(FlowerDetectionDraft {
                    object_name: object_name.to_string(),
                    flower_box_id: flower_index,
                    bbox: flower.bbox,
                    class_name: flower.class_name.clone(),
                    score: flower.score,
                    width: crop_width,
                    height: crop_height,
                });

                // Pollinator boxes come back relative to the crop frame, the
                // same frame the model was fed; the resolver maps them to
                // image-absolute coordinates later.
                let pollinators = match pollinator_model.predict(&flower.crop) {
                    Ok(pollinators) => pollinators,
                    Err(e) => {
                        tracing::warn!(
                            object = %object_name,
                            flower_box_id = flower_index,
                            error = %e,
                            "Pollinator inference failed; skipping crop"
                        );
                        continue;
                    }
                };
                for pollinator in pollinators {
                    output.pollinator_drafts.push(PollinatorDetectionDraft {
                        object_name: object_name.to_string(),
                        flower_box_id: flower_index,
                        bbox: pollinator.bbox,
                        class_name: pollinator.class_name,
                        score: pollinator.score,
                    });
                }
            }

            output.processed += 1;
            let done = self.progress.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(
                object = %object_name,
                flowers = flowers.len(),
                progress = done,
                total = batch.len(),
                "Image processed"
            );
        }

        tracing::info!(
            processed = output.processed,
            skipped = output.skipped.len(),
            flowers = output.flower_drafts.len(),
            pollinators = output.pollinator_drafts.len(),
            "Inference completed for batch"
        );
        output
    }
}
