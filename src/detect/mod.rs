mod backend;
pub mod backends;
mod result;
mod service;

pub use backend::ObjectDetector;
pub use result::{DetectedRegion, Detections};
pub use service::{DetectorLoader, DetectorService, ModelState};
