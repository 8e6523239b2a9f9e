#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::embed::backend::RegionEmbedder;

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_55, 0.261_302_6, 0.275_777_1];

/// CLIP-style image encoder exported to ONNX, run through tract.
///
/// Input is `1x3xSxS`, normalized with the CLIP channel statistics; output is
/// a `1xD` embedding.
pub struct TractClipEmbedder {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    dimension: usize,
}

impl TractClipEmbedder {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
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

        let mut embedder = Self {
            model,
            input_size,
            dimension: 0,
        };
        let probe = embedder.run(&RgbImage::new(input_size, input_size))?;
        embedder.dimension = probe.len();
        Ok(embedder)
    }

    fn run(&self, region: &RgbImage) -> Result<Vec<f32>> {
        let size = self.input_size;
        let resized = imageops::resize(region, size, size, FilterType::CatmullRom);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, channel, y, x)| {
                let value = resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0;
                (value - CLIP_MEAN[channel]) / CLIP_STD[channel]
            },
        );
        let outputs = self
            .model
            .run(tvec!(input.into_tensor().into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        Ok(view.iter().copied().collect())
    }
}

impl RegionEmbedder for TractClipEmbedder {
    fn name(&self) -> &'static str {
        "tract-clip"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&mut self, region: &RgbImage) -> Result<Vec<f32>> {
        self.run(region)
    }
}
