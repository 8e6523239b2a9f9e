use anyhow::Result;
use image::RgbImage;

/// Image-region embedding backend.
///
/// Output does not need to be normalized; `EmbeddingService` L2-normalizes
/// every vector before it leaves the service.
pub trait RegionEmbedder: Send {
    fn name(&self) -> &'static str;

    /// Fixed output dimensionality.
    fn dimension(&self) -> usize;

    fn embed(&mut self, region: &RgbImage) -> Result<Vec<f32>>;
}

/// Scale a vector to unit length in place. Returns false for zero or non-finite vectors.
pub fn l2_normalize(vector: &mut [f32]) -> bool {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if !norm.is_finite() || norm <= f32::EPSILON {
        return false;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
    true
}
