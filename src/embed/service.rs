use std::sync::{Mutex, OnceLock};

use anyhow::anyhow;
use image::RgbImage;

use crate::config::{EmbedderBackendKind, EmbedderSettings};
use crate::embed::backend::{l2_normalize, RegionEmbedder};
use crate::embed::backends::HistogramEmbedder;
use crate::error::{AnalysisError, AnalysisResult};

pub type EmbedderLoader =
    Box<dyn Fn() -> AnalysisResult<Box<dyn RegionEmbedder>> + Send + Sync>;

pub enum EmbedderState {
    Ready(Mutex<Box<dyn RegionEmbedder>>),
    Unavailable { reason: String },
}

/// Process-wide embedding service with a lazily loaded, memoized backend.
pub struct EmbeddingService {
    loader: EmbedderLoader,
    state: OnceLock<EmbedderState>,
}

impl EmbeddingService {
    pub fn new(loader: EmbedderLoader) -> Self {
        Self {
            loader,
            state: OnceLock::new(),
        }
    }

    pub fn with_backend<E: RegionEmbedder + 'static>(backend: E) -> Self {
        let state = OnceLock::new();
        let _ = state.set(EmbedderState::Ready(Mutex::new(Box::new(backend))));
        Self {
            loader: Box::new(|| Err(AnalysisError::CapabilityUnavailable("already loaded".into()))),
            state,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(Box::new(move || {
            Err(AnalysisError::CapabilityUnavailable(reason.clone()))
        }))
    }

    pub fn from_settings(settings: &EmbedderSettings) -> Self {
        match settings.backend {
            EmbedderBackendKind::None => Self::unavailable("embedding disabled by configuration"),
            EmbedderBackendKind::Histogram => {
                Self::new(Box::new(|| {
                    Ok(Box::new(HistogramEmbedder::new()) as Box<dyn RegionEmbedder>)
                }))
            }
            EmbedderBackendKind::Onnx => {
                let settings = settings.clone();
                Self::new(Box::new(move || load_onnx(&settings)))
            }
        }
    }

    pub fn load(&self) -> &EmbedderState {
        self.state.get_or_init(|| match (self.loader)() {
            Ok(backend) => {
                log::info!(
                    "embedder backend {} loaded (dim={})",
                    backend.name(),
                    backend.dimension()
                );
                EmbedderState::Ready(Mutex::new(backend))
            }
            Err(e) => {
                log::warn!("image embedder unavailable: {}", e);
                EmbedderState::Unavailable {
                    reason: e.to_string(),
                }
            }
        })
    }

    pub fn is_available(&self) -> bool {
        matches!(self.load(), EmbedderState::Ready(_))
    }

    /// Embed a region into a unit-length vector.
    ///
    /// `CapabilityUnavailable` means no backend exists; callers treat it as a
    /// warning. Any other error is an inference failure.
    pub fn embed(&self, region: &RgbImage) -> AnalysisResult<Vec<f32>> {
        match self.load() {
            EmbedderState::Unavailable { reason } => {
                Err(AnalysisError::CapabilityUnavailable(reason.clone()))
            }
            EmbedderState::Ready(backend) => {
                let mut guard = backend
                    .lock()
                    .map_err(|_| anyhow!("embedder lock poisoned"))?;
                let mut vector = guard.embed(region)?;
                let expected = guard.dimension();
                if vector.len() != expected {
                    return Err(anyhow!(
                        "embedder {} returned {} values, expected {}",
                        guard.name(),
                        vector.len(),
                        expected
                    )
                    .into());
                }
                if !l2_normalize(&mut vector) {
                    return Err(anyhow!("embedder {} returned a zero vector", guard.name()).into());
                }
                Ok(vector)
            }
        }
    }
}

fn load_onnx(settings: &EmbedderSettings) -> AnalysisResult<Box<dyn RegionEmbedder>> {
    let Some(model_path) = settings.model_path.as_ref() else {
        return Err(AnalysisError::CapabilityUnavailable(
            "no embedding model configured".to_string(),
        ));
    };
    if !model_path.exists() {
        return Err(AnalysisError::CapabilityUnavailable(format!(
            "embedding model not found at {}",
            model_path.display()
        )));
    }

    #[cfg(feature = "backend-tract")]
    {
        crate::embed::backends::TractClipEmbedder::new(model_path, settings.input_size)
            .map(|backend| Box::new(backend) as Box<dyn RegionEmbedder>)
            .map_err(|e| {
                AnalysisError::CapabilityUnavailable(format!("failed to load embedder: {:#}", e))
            })
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        Err(AnalysisError::CapabilityUnavailable(
            "ONNX embeddings require the backend-tract feature".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct ConstantEmbedder(Vec<f32>);

    impl RegionEmbedder for ConstantEmbedder {
        fn name(&self) -> &'static str {
            "constant"
        }

        fn dimension(&self) -> usize {
            3
        }

        fn embed(&mut self, _region: &RgbImage) -> anyhow::Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn output_is_unit_length() {
        let service = EmbeddingService::with_backend(ConstantEmbedder(vec![2.0, 0.0, 0.0]));
        let vector = service.embed(&RgbImage::new(2, 2)).unwrap();
        assert_eq!(vector, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn wrong_dimension_is_an_inference_error() {
        let service = EmbeddingService::with_backend(ConstantEmbedder(vec![1.0, 1.0]));
        let err = service.embed(&RgbImage::new(2, 2)).unwrap_err();
        assert!(matches!(err, AnalysisError::Internal(_)));
    }

    #[test]
    fn missing_backend_is_capability_unavailable() {
        let service = EmbeddingService::from_settings(&EmbedderSettings {
            backend: EmbedderBackendKind::Onnx,
            model_path: None,
            ..EmbedderSettings::default()
        });
        let err = service.embed(&RgbImage::new(2, 2)).unwrap_err();
        assert!(matches!(err, AnalysisError::CapabilityUnavailable(_)));
        assert!(!service.is_available());
    }

    #[test]
    fn histogram_backend_from_settings() {
        let service = EmbeddingService::from_settings(&EmbedderSettings {
            backend: EmbedderBackendKind::Histogram,
            ..EmbedderSettings::default()
        });
        let region = RgbImage::from_pixel(4, 4, Rgb([10, 200, 30]));
        let vector = service.embed(&region).unwrap();
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
