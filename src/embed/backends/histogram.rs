use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::embed::backend::RegionEmbedder;

const BINS_PER_CHANNEL: usize = 4;
const DIMENSION: usize = BINS_PER_CHANNEL * BINS_PER_CHANNEL * BINS_PER_CHANNEL;

/// Joint RGB color histogram (4x4x4 bins) with square-root weighting.
///
/// No model weights are involved, so it is always available. Similarity is
/// coarse: two photos of the same object under similar light score high.
#[derive(Clone, Copy, Debug, Default)]
pub struct HistogramEmbedder;

impl HistogramEmbedder {
    pub fn new() -> Self {
        Self
    }
}

impl RegionEmbedder for HistogramEmbedder {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn embed(&mut self, region: &RgbImage) -> Result<Vec<f32>> {
        let pixel_count = region.width() as usize * region.height() as usize;
        if pixel_count == 0 {
            return Err(anyhow!("cannot embed an empty region"));
        }
        let mut histogram = vec![0u32; DIMENSION];
        let shift = 8 - BINS_PER_CHANNEL.trailing_zeros();
        for pixel in region.pixels() {
            let [r, g, b] = pixel.0;
            let idx = ((r >> shift) as usize * BINS_PER_CHANNEL + (g >> shift) as usize)
                * BINS_PER_CHANNEL
                + (b >> shift) as usize;
            histogram[idx] += 1;
        }
        Ok(histogram
            .into_iter()
            .map(|count| (count as f32 / pixel_count as f32).sqrt())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn solid_color_hits_one_bin() {
        let mut embedder = HistogramEmbedder::new();
        let region = RgbImage::from_pixel(8, 8, Rgb([255, 0, 0]));
        let vector = embedder.embed(&region).unwrap();
        assert_eq!(vector.len(), 64);
        assert_eq!(vector.iter().filter(|v| **v > 0.0).count(), 1);
        assert_eq!(vector[3 * 16], 1.0);
    }

    #[test]
    fn empty_region_is_an_error() {
        let mut embedder = HistogramEmbedder::new();
        assert!(embedder.embed(&RgbImage::new(0, 0)).is_err());
    }
}
