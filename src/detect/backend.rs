use anyhow::Result;
use image::RgbImage;

use crate::detect::result::DetectedRegion;

/// Object localization backend.
///
/// Implementations receive a decoded RGB image and a confidence floor and
/// return regions in pixel space, strongest first. An empty result is legal;
/// `DetectorService` is responsible for the never-empty guarantee.
pub trait ObjectDetector: Send {
    /// Backend identifier, recorded in the Detection diagnostics.
    fn name(&self) -> &'static str;

    /// Run detection on an image.
    fn detect(&mut self, image: &RgbImage, confidence: f32) -> Result<Vec<DetectedRegion>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
