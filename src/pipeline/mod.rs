//! Detection orchestrator.
//!
//! `Pipeline` owns the persistence handle and shares the detector and
//! embedder services by reference. Every analysis run creates its Detection
//! row as `in_progress` before touching media and finishes it as `done` or
//! `failed` before returning.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::{MatcherSettings, PipelineConfig, VideoSettings};
use crate::detect::DetectorService;
use crate::embed::EmbeddingService;
use crate::error::{AnalysisError, AnalysisResult};
use crate::matcher::CandidateMatcher;
use crate::media::{FilesystemMediaStore, MediaStore};
use crate::model::{Detection, DetectionStatus, MediaRecord, ReviewLogEntry};
use crate::store::Store;

mod analyze;
mod reconcile;
mod review;
mod upload;
mod video;

pub use video::VideoOptions;

pub const STALE_SWEEP_ERROR: &str = "stale in_progress run swept";

pub struct Pipeline {
    store: Store,
    media: Box<dyn MediaStore>,
    detector: Arc<DetectorService>,
    embedder: Arc<EmbeddingService>,
    matcher: CandidateMatcher,
    matcher_settings: MatcherSettings,
    video_defaults: VideoSettings,
}

impl Pipeline {
    /// Build the pipeline and its services from configuration.
    pub fn open(cfg: &PipelineConfig) -> Result<Self> {
        let store = Store::open(&cfg.db_path)?;
        let media = Box::new(FilesystemMediaStore::new(&cfg.media));
        let detector = Arc::new(DetectorService::from_settings(&cfg.detector));
        let embedder = Arc::new(EmbeddingService::from_settings(&cfg.embedder));
        Ok(Self::new(store, media, detector, embedder, cfg))
    }

    pub fn new(
        store: Store,
        media: Box<dyn MediaStore>,
        detector: Arc<DetectorService>,
        embedder: Arc<EmbeddingService>,
        cfg: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            media,
            detector,
            embedder,
            matcher: CandidateMatcher::new(&cfg.matcher),
            matcher_settings: cfg.matcher,
            video_defaults: cfg.video,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn detector(&self) -> &Arc<DetectorService> {
        &self.detector
    }

    pub fn embedder(&self) -> &Arc<EmbeddingService> {
        &self.embedder
    }

    /// Full Detection aggregate with objects and candidates.
    pub fn detection(&self, detection_id: i64) -> AnalysisResult<Detection> {
        self.store
            .detection(detection_id)?
            .ok_or_else(|| AnalysisError::not_found("detection", detection_id))
    }

    pub fn list_detections(&self, status: DetectionStatus) -> AnalysisResult<Vec<Detection>> {
        Ok(self.store.detections_by_status(status)?)
    }

    pub fn review_log(&self, detection_id: i64) -> AnalysisResult<Vec<ReviewLogEntry>> {
        self.detection(detection_id)?;
        Ok(self.store.review_log(detection_id)?)
    }

    /// Fail `in_progress` detections created more than `older_than` ago.
    ///
    /// Such rows are left behind by runs that never returned (crash or
    /// cancellation). Returns the ids that were swept.
    pub fn sweep_stale(&mut self, older_than: Duration) -> AnalysisResult<Vec<i64>> {
        let cutoff = crate::now_s()?.saturating_sub(older_than.as_secs()) as i64;
        let mut swept = Vec::new();
        for detection_id in self.store.stale_in_progress(cutoff)? {
            let Some(detection) = self.store.detection(detection_id)? else {
                continue;
            };
            let mut diagnostics = detection.diagnostics.clone();
            diagnostics.error = Some(STALE_SWEEP_ERROR.to_string());
            if self
                .store
                .finish_detection(detection_id, DetectionStatus::Failed, &diagnostics, &[])?
            {
                swept.push(detection_id);
                self.reconcile_detection(detection_id)?;
            }
        }
        if !swept.is_empty() {
            log::warn!("swept {} stale in_progress detection(s): {:?}", swept.len(), swept);
        }
        Ok(swept)
    }

    fn require_media(&self, media_id: i64) -> AnalysisResult<MediaRecord> {
        self.store
            .media(media_id)?
            .ok_or_else(|| AnalysisError::not_found("media", media_id))
    }

    /// Referenced item and location ids must exist.
    fn require_links(&self, item_id: Option<i64>, location_id: Option<i64>) -> AnalysisResult<()> {
        if let Some(item_id) = item_id {
            if self.store.item_workspace(item_id)?.is_none() {
                return Err(AnalysisError::not_found("item", item_id));
            }
        }
        if let Some(location_id) = location_id {
            if self.store.location_workspace(location_id)?.is_none() {
                return Err(AnalysisError::not_found("location", location_id));
            }
        }
        Ok(())
    }
}
