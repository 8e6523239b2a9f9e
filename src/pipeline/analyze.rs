use anyhow::{Context, Result};
use image::RgbImage;

use super::Pipeline;
use crate::error::{AnalysisError, AnalysisResult};
use crate::media::{content_hash, is_synthetic};
use crate::model::{
    Detection, DetectionStatus, Diagnostics, MediaRecord, ObjectSnapshot, Progress,
};
use crate::store::NewObject;

pub(super) const EMBEDDER_UNAVAILABLE: &str = "embedder_unavailable";

/// Per-frame context carried into one run.
#[derive(Clone, Copy, Default)]
pub(super) struct FrameContext<'a> {
    pub frame_index: Option<u64>,
    pub progress: Option<Progress>,
    pub hints: &'a [i64],
}

/// Signals that stay fixed for every region of one media.
struct MatchInputs {
    hash_items: Vec<i64>,
    pool: Option<Vec<(i64, Vec<f32>)>>,
}

impl Pipeline {
    /// Analyze one stored photo.
    ///
    /// Missing media fails before any row is written; everything after the
    /// Detection row exists is folded into its terminal status.
    pub fn analyze(&mut self, media_id: i64) -> AnalysisResult<Detection> {
        let media = self.require_media(media_id)?;
        if is_synthetic(&media.path) || !self.media.exists(&media.path) {
            return Err(AnalysisError::MediaUnreadable(format!(
                "media file not found: {}",
                self.media.resolve(&media.path).display()
            )));
        }

        let detection_id = self.begin_run(media_id, FrameContext::default())?;
        let mut diagnostics = Diagnostics::default();
        let result = self
            .load_photo(&media)
            .and_then(|(bytes, image)| {
                self.ensure_media_hash(&media, Some(&bytes))?;
                self.run_frame(&media, &image, FrameContext::default(), &mut diagnostics)
            });
        self.finish_run(&media, detection_id, diagnostics, result)
    }

    fn load_photo(&self, media: &MediaRecord) -> Result<(Vec<u8>, RgbImage)> {
        let bytes = self.media.read_bytes(&media.path)?;
        let image = image::load_from_memory(&bytes)
            .with_context(|| format!("decode image {}", media.path))?
            .to_rgb8();
        Ok((bytes, image))
    }

    /// Create the `in_progress` row on its own commit and mirror it.
    pub(super) fn begin_run(&mut self, media_id: i64, ctx: FrameContext<'_>) -> AnalysisResult<i64> {
        let diagnostics = Diagnostics {
            frame_index: ctx.frame_index,
            progress: ctx.progress,
            ..Diagnostics::default()
        };
        let detection_id =
            self.store
                .create_detection(media_id, DetectionStatus::InProgress, &diagnostics)?;
        log::debug!("detection {} started for media {}", detection_id, media_id);
        self.reconcile_best_effort(detection_id);
        Ok(detection_id)
    }

    /// Persist the run outcome and return the completed Detection.
    pub(super) fn finish_run(
        &mut self,
        media: &MediaRecord,
        detection_id: i64,
        mut diagnostics: Diagnostics,
        result: Result<Vec<NewObject>>,
    ) -> AnalysisResult<Detection> {
        let written = match result {
            Ok(objects) => {
                match self.store.finish_detection(
                    detection_id,
                    DetectionStatus::Done,
                    &diagnostics,
                    &objects,
                ) {
                    Ok(written) => written,
                    Err(e) => {
                        log::error!("persisting detection {} failed: {:#}", detection_id, e);
                        diagnostics.objects.clear();
                        diagnostics.error = Some(format!("{:#}", e));
                        self.store.finish_detection(
                            detection_id,
                            DetectionStatus::Failed,
                            &diagnostics,
                            &[],
                        )?
                    }
                }
            }
            Err(e) => {
                log::warn!("detection {} failed: {:#}", detection_id, e);
                diagnostics.objects.clear();
                diagnostics.error = Some(format!("{:#}", e));
                self.store.finish_detection(
                    detection_id,
                    DetectionStatus::Failed,
                    &diagnostics,
                    &[],
                )?
            }
        };
        if !written {
            log::warn!(
                "detection {} was already terminal when its run finished",
                detection_id
            );
        }
        if let Err(e) = self.store.mark_media_analyzed(media.id) {
            log::warn!("could not stamp media {} as analyzed: {:#}", media.id, e);
        }
        self.reconcile_best_effort(detection_id);
        self.detection(detection_id)
    }

    /// Detect, embed and match one decoded frame.
    pub(super) fn run_frame(
        &mut self,
        media: &MediaRecord,
        image: &RgbImage,
        ctx: FrameContext<'_>,
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<NewObject>> {
        diagnostics.frame_index = ctx.frame_index;
        diagnostics.progress = ctx.progress;

        let detections = self.detector.detect(image)?;
        diagnostics.detector = Some(detections.strategy.to_string());

        let (width, height) = image.dimensions();
        let mut inputs = MatchInputs {
            hash_items: self.hash_matches(media)?,
            pool: None,
        };
        let mut objects = Vec::with_capacity(detections.regions.len());

        for region in detections.regions {
            let bbox = region.bbox;
            let (x, y, w, h) = bbox.crop_rect();
            let crop = image::imageops::crop_imm(image, x, y, w.min(width - x), h.min(height - y))
                .to_image();

            let embedding = match self.embedder.embed(&crop) {
                Ok(vector) => Some(vector),
                Err(AnalysisError::CapabilityUnavailable(reason)) => {
                    log::debug!("embedding skipped: {}", reason);
                    diagnostics.warn(EMBEDDER_UNAVAILABLE);
                    None
                }
                Err(e) => return Err(anyhow::Error::from(e).context("embed region")),
            };

            if embedding.is_some() && inputs.pool.is_none() {
                inputs.pool = Some(self.similarity_pool(media)?);
            }
            let pool = inputs.pool.as_deref().unwrap_or(&[]);
            let candidates =
                self.matcher
                    .rank(&inputs.hash_items, embedding.as_deref(), pool, ctx.hints);

            diagnostics.objects.push(ObjectSnapshot {
                label: region.label.clone(),
                confidence: region.score,
                bbox,
                embedding: embedding.clone(),
            });
            objects.push(NewObject {
                label: region.label,
                confidence: region.score,
                bbox,
                suggested_location_id: media.location_id,
                candidates,
            });
        }

        Ok(objects)
    }

    /// Store the content hash when the media row has none.
    pub(super) fn ensure_media_hash(
        &mut self,
        media: &MediaRecord,
        bytes: Option<&[u8]>,
    ) -> Result<()> {
        if media.file_hash.is_some() || is_synthetic(&media.path) {
            return Ok(());
        }
        let hash = match bytes {
            Some(bytes) => content_hash(bytes),
            None => content_hash(&self.media.read_bytes(&media.path)?),
        };
        self.store.set_media_hash(media.id, &hash)
    }

    fn hash_matches(&self, media: &MediaRecord) -> Result<Vec<i64>> {
        // Re-read: the hash may have just been computed for this run.
        let Some(hash) = self
            .store
            .media(media.id)?
            .and_then(|m| m.file_hash)
        else {
            return Ok(Vec::new());
        };
        self.store
            .items_with_hash(media.workspace_id, &hash, media.id, self.scope_location(media))
    }

    fn scope_location(&self, media: &MediaRecord) -> Option<i64> {
        if self.matcher_settings.scope_to_location {
            media.location_id
        } else {
            None
        }
    }

    /// Embeddings of the most recent workspace items. Items without a stored
    /// vector are embedded from their first linked photo and cached.
    fn similarity_pool(&mut self, media: &MediaRecord) -> Result<Vec<(i64, Vec<f32>)>> {
        let entries = self.store.embedding_pool(
            media.workspace_id,
            self.scope_location(media),
            self.matcher_settings.pool_size,
        )?;
        let mut pool = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.embedding {
                Some(vector) => pool.push((entry.item_id, vector)),
                None => match self.embed_item(entry.item_id) {
                    Ok(Some(vector)) => pool.push((entry.item_id, vector)),
                    Ok(None) => {}
                    Err(e) => {
                        log::debug!("item {} could not be embedded: {:#}", entry.item_id, e)
                    }
                },
            }
        }
        Ok(pool)
    }

    fn embed_item(&mut self, item_id: i64) -> Result<Option<Vec<f32>>> {
        let Some(photo) = self.store.item_photo(item_id)? else {
            return Ok(None);
        };
        if !self.media.exists(&photo.path) {
            return Ok(None);
        }
        let (_, image) = self.load_photo(&photo)?;
        let vector = self.embedder.embed(&image).map_err(anyhow::Error::from)?;
        self.store.put_item_embedding(item_id, &vector)?;
        Ok(Some(vector))
    }
}
