#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::ObjectDetector;
use crate::detect::result::DetectedRegion;
use crate::model::BoundingBox;

const NMS_IOU_THRESHOLD: f32 = 0.45;
const MAX_REGIONS: usize = 50;

/// YOLOv8-style ONNX detector run through tract.
///
/// The model takes a `1x3xSxS` RGB tensor in [0, 1] and produces `1x(4+C)xN`
/// rows of `cx, cy, w, h, class scores...` in input-pixel space.
pub struct TractYoloBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    labels: Vec<String>,
}

impl TractYoloBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, labels: Vec<String>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            labels,
        })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let size = self.input_size;
        let resized = imageops::resize(image, size, size, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn label_for(&self, class_idx: usize) -> String {
        self.labels
            .get(class_idx)
            .cloned()
            .unwrap_or_else(|| "object".to_string())
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        width: u32,
        height: u32,
        confidence: f32,
    ) -> Result<Vec<DetectedRegion>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output was not rank 3")?;
        let (_, rows, anchors) = view.dim();
        if rows < 5 {
            return Err(anyhow!("model output has {} rows, expected at least 5", rows));
        }

        let sx = width as f32 / self.input_size as f32;
        let sy = height as f32 / self.input_size as f32;
        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_idx, score) = (4..rows)
                .map(|row| (row - 4, view[[0, row, anchor]]))
                .fold((0usize, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < confidence {
                continue;
            }
            let cx = view[[0, 0, anchor]];
            let cy = view[[0, 1, anchor]];
            let w = view[[0, 2, anchor]];
            let h = view[[0, 3, anchor]];
            let Ok(bbox) = BoundingBox::new(
                (cx - w / 2.0) * sx,
                (cy - h / 2.0) * sy,
                (cx + w / 2.0) * sx,
                (cy + h / 2.0) * sy,
            ) else {
                continue;
            };
            let Some(bbox) = bbox.clamp_to(width, height) else {
                continue;
            };
            candidates.push((class_idx, DetectedRegion::new(bbox, self.label_for(class_idx), score)));
        }

        Ok(non_max_suppression(candidates))
    }
}

/// Per-class greedy NMS, strongest first.
fn non_max_suppression(mut candidates: Vec<(usize, DetectedRegion)>) -> Vec<DetectedRegion> {
    candidates.sort_by(|a, b| b.1.score.total_cmp(&a.1.score));
    let mut kept: Vec<(usize, DetectedRegion)> = Vec::new();
    for (class_idx, region) in candidates {
        let overlaps = kept.iter().any(|(kept_class, kept_region)| {
            *kept_class == class_idx && kept_region.bbox.iou(&region.bbox) > NMS_IOU_THRESHOLD
        });
        if !overlaps {
            kept.push((class_idx, region));
        }
        if kept.len() >= MAX_REGIONS {
            break;
        }
    }
    kept.into_iter().map(|(_, region)| region).collect()
}

impl ObjectDetector for TractYoloBackend {
    fn name(&self) -> &'static str {
        "tract-yolo"
    }

    fn detect(&mut self, image: &RgbImage, confidence: f32) -> Result<Vec<DetectedRegion>> {
        let (width, height) = image.dimensions();
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, width, height, confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_drops_overlapping_boxes_of_same_class() {
        let a = DetectedRegion::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0).unwrap(), "cup", 0.9);
        let b = DetectedRegion::new(BoundingBox::new(1.0, 1.0, 10.0, 10.0).unwrap(), "cup", 0.8);
        let c = DetectedRegion::new(BoundingBox::new(1.0, 1.0, 10.0, 10.0).unwrap(), "book", 0.7);
        let kept = non_max_suppression(vec![(1, b), (1, a), (2, c)]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].label, "book");
    }
}
