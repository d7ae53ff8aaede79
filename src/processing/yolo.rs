use image::{DynamicImage, GenericImageView};
use ndarray::{Array, ArrayD, IxDyn};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::Session;
use ort::value::Value;

use crate::models::{BoundingBox, ModelParams, PipelineError, Result};
use crate::processing::detector::{Detection, DetectionModel};

/// ONNX YOLO detector. Expects a single-input network taking
/// `[1, 3, image_size, image_size]` and producing a
/// `[1, 4 + num_classes, num_boxes]` tensor of center-format boxes.
pub struct YoloDetector {
    session: Session,
    params: ModelParams,
}

impl YoloDetector {
    pub fn from_params(params: &ModelParams) -> Result<Self> {
        let bytes = std::fs::read(&params.weights_path).map_err(|e| {
            PipelineError::Model(format!("cannot read weights {}: {}", params.weights_path, e))
        })?;
        let session = Session::builder()
            .map_err(|e| PipelineError::Model(format!("failed to create session builder: {}", e)))?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .map_err(|e| PipelineError::Model(format!("failed to set execution providers: {}", e)))?
            .commit_from_memory(&bytes)
            .map_err(|e| PipelineError::Model(format!("failed to load {}: {}", params.weights_path, e)))?;

        tracing::info!(
            weights = %params.weights_path,
            image_size = params.image_size,
            classes = params.class_names.len(),
            "Loaded detection model"
        );
        Ok(Self {
            session,
            params: params.clone(),
        })
    }
}

impl DetectionModel for YoloDetector {
    fn predict(&mut self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let (orig_width, orig_height) = image.dimensions();

        let input = preprocess_image(image, self.params.image_size);
        let input_value = Value::from_array(input)
            .map_err(|e| PipelineError::Model(format!("failed to build input tensor: {}", e)))?;
        let inputs = ort::inputs!["images" => input_value]
            .map_err(|e| PipelineError::Model(format!("failed to bind inputs: {}", e)))?;
        let outputs = self
            .session
            .run(inputs)
            .map_err(|e| PipelineError::Model(format!("inference failed: {}", e)))?;

        let (_, value) = outputs
            .iter()
            .next()
            .ok_or_else(|| PipelineError::Model("model produced no outputs".to_string()))?;
        let output = value
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(format!("failed to extract output tensor: {}", e)))?
            .into_owned();

        let candidates = decode_output(&output, &self.params, orig_width, orig_height)?;
        let mut kept = nms(candidates, self.params.iou_threshold);
        if self.params.multi_label {
            kept = suppress_cross_class(kept, self.params.multi_label_iou_threshold);
        }
        kept.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        kept.truncate(self.params.max_detections);

        let detections = kept
            .into_iter()
            .map(|c| {
                let crop = crop_with_margin(image, &c.bbox, self.params.margin);
                Detection {
                    bbox: c.bbox,
                    class_id: c.class_id,
                    class_name: c.class_name,
                    score: c.score,
                    crop,
                }
            })
            .collect();
        Ok(detections)
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub class_name: String,
    pub score: f32,
}

/// Resizes to a square model input (NCHW, f32, 0..1). The decode step undoes
/// the per-axis stretch, so no letterbox padding is needed.
pub fn preprocess_image(img: &DynamicImage, target_size: u32) -> ArrayD<f32> {
    let rgb = img.to_rgb8();
    let resized = image::imageops::resize(
        &rgb,
        target_size,
        target_size,
        image::imageops::FilterType::Triangle,
    );

    let mut input_data = Vec::with_capacity((3 * target_size * target_size) as usize);
    for c in 0..3 {
        for y in 0..target_size {
            for x in 0..target_size {
                input_data.push(resized.get_pixel(x, y)[c] as f32 / 255.0);
            }
        }
    }

    Array::from_shape_vec(
        IxDyn(&[1, 3, target_size as usize, target_size as usize]),
        input_data,
    )
    .expect("shape and buffer length are computed together")
}

/// Decodes a `[1, 4 + num_classes, num_boxes]` tensor into candidates in the
/// source frame. With `multi_label` every class above the confidence
/// threshold yields a candidate, otherwise only the best class does.
pub fn decode_output(
    output: &ArrayD<f32>,
    params: &ModelParams,
    img_width: u32,
    img_height: u32,
) -> Result<Vec<Candidate>> {
    let shape = output.shape();
    if shape.len() != 3 {
        return Err(PipelineError::Model(format!(
            "expected 3D output, got {}D",
            shape.len()
        )));
    }
    let num_classes = shape[1].saturating_sub(4).min(params.class_names.len());
    let num_boxes = shape[2];

    let scale_x = img_width as f32 / params.image_size as f32;
    let scale_y = img_height as f32 / params.image_size as f32;

    let mut candidates = Vec::new();
    for i in 0..num_boxes {
        let x_center = output[[0, 0, i]];
        let y_center = output[[0, 1, i]];
        let width = output[[0, 2, i]];
        let height = output[[0, 3, i]];

        let bbox = BoundingBox::new(
            (x_center - width / 2.0) * scale_x,
            (y_center - height / 2.0) * scale_y,
            (x_center + width / 2.0) * scale_x,
            (y_center + height / 2.0) * scale_y,
        );

        if params.multi_label {
            for class_idx in 0..num_classes {
                let score = output[[0, 4 + class_idx, i]];
                if score > params.confidence_threshold {
                    candidates.push(Candidate {
                        bbox,
                        class_id: class_idx,
                        class_name: params.class_names[class_idx].clone(),
                        score,
                    });
                }
            }
        } else {
            let mut best_score = 0.0;
            let mut best_class = 0;
            for class_idx in 0..num_classes {
                let score = output[[0, 4 + class_idx, i]];
                if score > best_score {
                    best_score = score;
                    best_class = class_idx;
                }
            }
            if best_score > params.confidence_threshold {
                candidates.push(Candidate {
                    bbox,
                    class_id: best_class,
                    class_name: params.class_names[best_class].clone(),
                    score: best_score,
                });
            }
        }
    }
    Ok(candidates)
}

/// Per-class non-maximum suppression.
pub fn nms(candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    if candidates.is_empty() {
        return candidates;
    }

    use std::collections::HashMap;
    let mut class_groups: HashMap<usize, Vec<Candidate>> = HashMap::new();
    for candidate in candidates {
        class_groups.entry(candidate.class_id).or_default().push(candidate);
    }

    let mut all_results = Vec::new();
    for (_, mut group) in class_groups {
        group.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut suppressed = vec![false; group.len()];
        for i in 0..group.len() {
            if suppressed[i] {
                continue;
            }
            for j in (i + 1)..group.len() {
                if !suppressed[j] && group[i].bbox.iou(&group[j].bbox) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }
        all_results.extend(
            group
                .into_iter()
                .zip(suppressed)
                .filter(|(_, s)| !*s)
                .map(|(c, _)| c),
        );
    }
    all_results
}

/// Cross-class suppression used in multi-label mode: duplicate labels on
/// near-identical boxes keep only the strongest one.
fn suppress_cross_class(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Cuts the box out of the image, expanded by `margin` pixels on every side
/// and clamped to the image bounds.
pub fn crop_with_margin(img: &DynamicImage, bbox: &BoundingBox, margin: i32) -> DynamicImage {
    let (img_width, img_height) = img.dimensions();

    let x0 = (bbox.x0 as i32 - margin).max(0) as u32;
    let y0 = (bbox.y0 as i32 - margin).max(0) as u32;
    let x1 = ((bbox.x1 as i32 + margin).max(0) as u32).min(img_width);
    let y1 = ((bbox.y1 as i32 + margin).max(0) as u32).min(img_height);

    let width = x1.saturating_sub(x0).max(1);
    let height = y1.saturating_sub(y0).max(1);
    img.crop_imm(x0, y0, width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(multi_label: bool) -> ModelParams {
        ModelParams {
            weights_path: "unused.onnx".to_string(),
            class_names: vec!["daisy".to_string(), "clover".to_string()],
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            margin: 10,
            multi_label,
            multi_label_iou_threshold: 0.9,
            max_detections: 10,
            augment: false,
            image_size: 100,
        }
    }

    /// Builds a [1, 4 + 2, n] tensor from (cx, cy, w, h, score0, score1) rows.
    fn tensor(rows: &[[f32; 6]]) -> ArrayD<f32> {
        let n = rows.len();
        let mut data = vec![0.0; 6 * n];
        for (i, row) in rows.iter().enumerate() {
            for (channel, value) in row.iter().enumerate() {
                data[channel * n + i] = *value;
            }
        }
        Array::from_shape_vec(IxDyn(&[1, 6, n]), data).unwrap()
    }

    #[test]
    fn test_decode_scales_to_source_frame() {
        // 100x100 model space, 200x400 source: x doubles, y quadruples.
        let output = tensor(&[[50.0, 50.0, 20.0, 10.0, 0.9, 0.1]]);
        let candidates = decode_output(&output, &params(false), 200, 400).unwrap();
        assert_eq!(candidates.len(), 1);
        let bbox = candidates[0].bbox;
        assert_eq!((bbox.x0, bbox.y0, bbox.x1, bbox.y1), (80.0, 180.0, 120.0, 220.0));
        assert_eq!(candidates[0].class_name, "daisy");
    }

    #[test]
    fn test_decode_filters_below_threshold() {
        let output = tensor(&[[50.0, 50.0, 20.0, 10.0, 0.4, 0.3]]);
        let candidates = decode_output(&output, &params(false), 100, 100).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_decode_multi_label_emits_both_classes() {
        let output = tensor(&[[50.0, 50.0, 20.0, 10.0, 0.8, 0.7]]);
        let candidates = decode_output(&output, &params(true), 100, 100).unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn test_nms_suppresses_overlap_within_class() {
        let output = tensor(&[
            [50.0, 50.0, 40.0, 40.0, 0.9, 0.0],
            [52.0, 52.0, 40.0, 40.0, 0.8, 0.0],
            [10.0, 10.0, 10.0, 10.0, 0.7, 0.0],
        ]);
        let candidates = decode_output(&output, &params(false), 100, 100).unwrap();
        let kept = nms(candidates, 0.45);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().any(|c| (c.score - 0.9).abs() < 1e-6));
        assert!(kept.iter().any(|c| (c.score - 0.7).abs() < 1e-6));
    }

    #[test]
    fn test_nms_keeps_overlap_across_classes() {
        let output = tensor(&[
            [50.0, 50.0, 40.0, 40.0, 0.9, 0.0],
            [52.0, 52.0, 40.0, 40.0, 0.0, 0.8],
        ]);
        let candidates = decode_output(&output, &params(false), 100, 100).unwrap();
        assert_eq!(nms(candidates, 0.45).len(), 2);
    }

    #[test]
    fn test_crop_with_margin_clamps_to_bounds() {
        let img = DynamicImage::new_rgb8(100, 80);
        let crop = crop_with_margin(&img, &BoundingBox::new(5.0, 5.0, 30.0, 30.0), 10);
        // x: 0..40, y: 0..40 after clamping the negative expansion
        assert_eq!(crop.dimensions(), (40, 40));
    }

    #[test]
    fn test_crop_with_margin_interior_box() {
        let img = DynamicImage::new_rgb8(200, 200);
        let crop = crop_with_margin(&img, &BoundingBox::new(50.0, 60.0, 90.0, 110.0), 5);
        assert_eq!(crop.dimensions(), (50, 60));
    }

    #[test]
    fn test_preprocess_shape() {
        let img = DynamicImage::new_rgb8(123, 77);
        let input = preprocess_image(&img, 64);
        assert_eq!(input.shape(), &[1, 3, 64, 64]);
    }
}
