use image::DynamicImage;

use crate::models::{BoundingBox, Result};

/// One detection in the source frame. `crop` is the margin-expanded,
/// bounds-clamped cutout the next cascade stage consumes.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub class_name: String,
    pub score: f32,
    pub crop: DynamicImage,
}

/// Detection capability: an image in, detections out. Implementations may
/// hold mutable inference state, hence `&mut self`.
pub trait DetectionModel: Send {
    fn predict(&mut self, image: &DynamicImage) -> Result<Vec<Detection>>;
}
