use std::sync::{Mutex, OnceLock};

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::config::DetectorSettings;
use crate::detect::backend::ObjectDetector;
use crate::detect::backends::blob::{full_frame_region, largest_blob};
use crate::detect::result::Detections;
use crate::error::AnalysisError;

/// Factory for the primary (model-backed) detector. Called at most once.
pub type DetectorLoader =
    Box<dyn Fn() -> std::result::Result<Box<dyn ObjectDetector>, AnalysisError> + Send + Sync>;

/// Memoized outcome of loading the primary detector.
pub enum ModelState {
    Ready(Mutex<Box<dyn ObjectDetector>>),
    Degraded { reason: String },
}

/// Process-wide detector service.
///
/// The primary model is loaded lazily on first use and the outcome, success or
/// failure, is cached for the lifetime of the service. A degraded service
/// answers every call from the blob fallback without retrying the load.
pub struct DetectorService {
    loader: DetectorLoader,
    state: OnceLock<ModelState>,
    confidence: f32,
}

impl DetectorService {
    pub fn new(loader: DetectorLoader, confidence: f32) -> Self {
        Self {
            loader,
            state: OnceLock::new(),
            confidence,
        }
    }

    /// Service with a fixed primary backend.
    pub fn with_backend<B: ObjectDetector + 'static>(backend: B, confidence: f32) -> Self {
        let state = OnceLock::new();
        let _ = state.set(ModelState::Ready(Mutex::new(Box::new(backend))));
        Self {
            loader: Box::new(|| Err(AnalysisError::CapabilityUnavailable("already loaded".into()))),
            state,
            confidence,
        }
    }

    /// Service whose primary model is known to be missing.
    pub fn unavailable(reason: impl Into<String>, confidence: f32) -> Self {
        let reason = reason.into();
        Self::new(
            Box::new(move || Err(AnalysisError::CapabilityUnavailable(reason.clone()))),
            confidence,
        )
    }

    pub fn from_settings(settings: &DetectorSettings) -> Self {
        let settings_for_load = settings.clone();
        Self::new(
            Box::new(move || load_primary(&settings_for_load)),
            settings.confidence,
        )
    }

    /// Load the primary detector once; later calls return the cached state.
    pub fn load(&self) -> &ModelState {
        self.state.get_or_init(|| match (self.loader)() {
            Ok(mut backend) => {
                if let Err(e) = backend.warm_up() {
                    log::warn!("detector {} warm-up failed: {:#}", backend.name(), e);
                }
                log::info!("detector backend {} loaded", backend.name());
                ModelState::Ready(Mutex::new(backend))
            }
            Err(e) => {
                log::warn!("object detector unavailable, using blob fallback: {}", e);
                ModelState::Degraded {
                    reason: e.to_string(),
                }
            }
        })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.load(), ModelState::Degraded { .. })
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Detect regions. Never returns an empty region list, and every
    /// returned box lies inside the image.
    ///
    /// Inference errors from the primary model are returned to the caller;
    /// an absent model, or a result with no box inside the frame, falls back
    /// to the blob heuristic.
    pub fn detect(&self, image: &RgbImage) -> Result<Detections> {
        if let ModelState::Ready(backend) = self.load() {
            let mut guard = backend
                .lock()
                .map_err(|_| anyhow!("detector lock poisoned"))?;
            let (width, height) = image.dimensions();
            let raw = guard.detect(image, self.confidence)?;
            let found = raw.len();
            let regions: Vec<_> = raw
                .into_iter()
                .filter_map(|mut region| {
                    region.bbox = region.bbox.clamp_to(width, height)?;
                    Some(region)
                })
                .collect();
            if regions.len() < found {
                log::debug!(
                    "detector {} returned {} boxes outside the {}x{} frame",
                    guard.name(),
                    found - regions.len(),
                    width,
                    height
                );
            }
            if !regions.is_empty() {
                return Ok(Detections {
                    regions,
                    strategy: guard.name(),
                });
            }
            log::debug!("detector {} found nothing, using fallback", guard.name());
        }
        Ok(fallback_detect(image))
    }
}

fn fallback_detect(image: &RgbImage) -> Detections {
    match largest_blob(image) {
        Some(region) => Detections {
            regions: vec![region],
            strategy: "blob",
        },
        None => {
            let (width, height) = image.dimensions();
            Detections {
                regions: vec![full_frame_region(width, height)],
                strategy: "full_frame",
            }
        }
    }
}

fn load_primary(
    settings: &DetectorSettings,
) -> std::result::Result<Box<dyn ObjectDetector>, AnalysisError> {
    let Some(model_path) = settings.model_path.as_ref() else {
        return Err(AnalysisError::CapabilityUnavailable(
            "no detector model configured".to_string(),
        ));
    };
    if !model_path.exists() {
        return Err(AnalysisError::CapabilityUnavailable(format!(
            "detector weights not found at {}",
            model_path.display()
        )));
    }

    #[cfg(feature = "backend-tract")]
    {
        let labels = crate::detect::backends::load_labels(settings.labels_path.as_deref())
            .map_err(|e| AnalysisError::CapabilityUnavailable(format!("{:#}", e)))?;
        crate::detect::backends::TractYoloBackend::new(model_path, settings.input_size, labels)
            .map(|backend| Box::new(backend) as Box<dyn ObjectDetector>)
            .map_err(|e| {
                AnalysisError::CapabilityUnavailable(format!("failed to load detector: {:#}", e))
            })
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        Err(AnalysisError::CapabilityUnavailable(
            "model-backed detection requires the backend-tract feature".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::DetectedRegion;
    use crate::model::BoundingBox;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedBackend {
        regions: Vec<DetectedRegion>,
        fail: bool,
    }

    impl ObjectDetector for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&mut self, _image: &RgbImage, confidence: f32) -> Result<Vec<DetectedRegion>> {
            if self.fail {
                return Err(anyhow!("inference crashed"));
            }
            Ok(self
                .regions
                .iter()
                .filter(|r| r.score >= confidence)
                .cloned()
                .collect())
        }
    }

    fn cup(score: f32) -> DetectedRegion {
        DetectedRegion::new(BoundingBox::new(1.0, 1.0, 5.0, 5.0).unwrap(), "cup", score)
    }

    #[test]
    fn unavailable_model_still_yields_a_region() {
        let service = DetectorService::unavailable("weights missing", 0.25);
        let detections = service.detect(&RgbImage::new(10, 10)).unwrap();
        assert_eq!(detections.regions.len(), 1);
        assert_eq!(detections.strategy, "full_frame");
        assert!(service.is_degraded());
    }

    #[test]
    fn load_failure_is_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let service = DetectorService::new(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AnalysisError::CapabilityUnavailable("no weights".into()))
            }),
            0.25,
        );
        for _ in 0..3 {
            service.detect(&RgbImage::new(4, 4)).unwrap();
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn confidence_floor_is_applied_and_empty_falls_back() {
        let service = DetectorService::with_backend(
            FixedBackend {
                regions: vec![cup(0.9), cup(0.1)],
                fail: false,
            },
            0.25,
        );
        let detections = service.detect(&RgbImage::new(10, 10)).unwrap();
        assert_eq!(detections.strategy, "fixed");
        assert_eq!(detections.regions.len(), 1);

        let empty = DetectorService::with_backend(
            FixedBackend {
                regions: vec![cup(0.1)],
                fail: false,
            },
            0.5,
        );
        let detections = empty.detect(&RgbImage::new(10, 10)).unwrap();
        assert_eq!(detections.regions.len(), 1);
        assert_ne!(detections.strategy, "fixed");
    }

    #[test]
    fn boxes_are_clipped_to_the_frame() {
        let service = DetectorService::with_backend(
            FixedBackend {
                regions: vec![DetectedRegion::new(
                    BoundingBox::new(6.0, 2.0, 40.0, 8.0).unwrap(),
                    "shelf",
                    0.8,
                )],
                fail: false,
            },
            0.25,
        );
        let detections = service.detect(&RgbImage::new(10, 10)).unwrap();
        assert_eq!(detections.strategy, "fixed");
        assert_eq!(
            detections.regions[0].bbox,
            BoundingBox::new(6.0, 2.0, 10.0, 8.0).unwrap()
        );
    }

    #[test]
    fn boxes_outside_the_frame_fall_back() {
        let service = DetectorService::with_backend(
            FixedBackend {
                regions: vec![DetectedRegion::new(
                    BoundingBox::new(500.0, 500.0, 600.0, 600.0).unwrap(),
                    "ghost",
                    0.9,
                )],
                fail: false,
            },
            0.25,
        );
        let detections = service.detect(&RgbImage::new(64, 48)).unwrap();
        assert_ne!(detections.strategy, "fixed");
        assert!(!detections.regions.is_empty());
        for region in &detections.regions {
            assert!(region.bbox.x2 <= 64.0 && region.bbox.y2 <= 48.0);
        }
    }

    #[test]
    fn inference_errors_propagate() {
        let service = DetectorService::with_backend(
            FixedBackend {
                regions: Vec::new(),
                fail: true,
            },
            0.25,
        );
        assert!(service.detect(&RgbImage::new(10, 10)).is_err());
    }

    #[test]
    fn settings_without_model_degrade() {
        let settings = DetectorSettings {
            model_path: Some("/nonexistent/yolov8n.onnx".into()),
            ..DetectorSettings::default()
        };
        let service = DetectorService::from_settings(&settings);
        match service.load() {
            ModelState::Degraded { reason } => assert!(reason.contains("not found")),
            ModelState::Ready(_) => panic!("expected degraded detector"),
        }
    }
}
