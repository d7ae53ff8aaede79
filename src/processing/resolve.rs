use std::collections::{HashMap, HashSet};

use crate::models::{PersistedFlower, PipelineError, PollinatorDetectionDraft, PollinatorRow};

#[derive(Debug, Default)]
pub struct ResolveOutput {
    pub rows: Vec<PollinatorRow>,
    /// Images dropped because a draft referenced a flower row that does not
    /// exist. This is an internal invariant violation, fatal to that image
    /// only.
    pub dropped_images: Vec<String>,
}

/// Maps crop-local pollinator boxes to image-absolute coordinates and swaps
/// the batch-local flower index for the database `flower_id`.
///
/// The crop fed to the pollinator model was the flower box expanded by
/// `margin` pixels on every side, so the crop origin in image coordinates is
/// `(flower.x0 - margin, flower.y0 - margin)`; both corners of the local box
/// are offset by that origin.
pub struct CoordinateResolver {
    margin: i32,
}

impl CoordinateResolver {
    pub fn new(margin: i32) -> Self {
        Self { margin }
    }

    pub fn resolve(
        &self,
        flowers: &[PersistedFlower],
        drafts: &[PollinatorDetectionDraft],
    ) -> ResolveOutput {
        let index: HashMap<(&str, usize), &PersistedFlower> = flowers
            .iter()
            .map(|f| ((f.object_name.as_str(), f.flower_box_id), f))
            .collect();

        let mut dropped: HashSet<String> = HashSet::new();
        let mut resolved: Vec<(String, PollinatorRow)> = Vec::new();

        for draft in drafts {
            let Some(flower) = index.get(&(draft.object_name.as_str(), draft.flower_box_id)) else {
                let err = PipelineError::UnresolvedJoin {
                    object: draft.object_name.clone(),
                    flower_box_id: draft.flower_box_id,
                };
                tracing::error!(error = %err, "Dropping image after join failure");
                dropped.insert(draft.object_name.clone());
                continue;
            };

            let origin_x = flower.x0 - self.margin;
            let origin_y = flower.y0 - self.margin;
            resolved.push((
                draft.object_name.clone(),
                PollinatorRow {
                    result_id: flower.result_id,
                    flower_id: flower.flower_id,
                    class_name: draft.class_name.clone(),
                    confidence: draft.score,
                    x0: origin_x + draft.bbox.x0 as i32,
                    y0: origin_y + draft.bbox.y0 as i32,
                    x1: origin_x + draft.bbox.x1 as i32,
                    y1: origin_y + draft.bbox.y1 as i32,
                },
            ));
        }

        let rows = resolved
            .into_iter()
            .filter(|(object_name, _)| !dropped.contains(object_name))
            .map(|(_, row)| row)
            .collect();

        ResolveOutput {
            rows,
            dropped_images: dropped.into_iter().collect(),
        }
    }
}
