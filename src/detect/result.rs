use crate::model::BoundingBox;

/// A region returned by a detector backend.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedRegion {
    /// Pixel-space box.
    pub bbox: BoundingBox,
    /// Free-text class name.
    pub label: String,
    /// Score in [0, 1].
    pub score: f32,
}

impl DetectedRegion {
    pub fn new(bbox: BoundingBox, label: impl Into<String>, score: f32) -> Self {
        Self {
            bbox,
            label: label.into(),
            score: score.clamp(0.0, 1.0),
        }
    }
}

/// Output of `DetectorService::detect`: never-empty regions plus the strategy that produced them.
#[derive(Clone, Debug)]
pub struct Detections {
    pub regions: Vec<DetectedRegion>,
    pub strategy: &'static str,
}
