use anyhow::Context;

use super::analyze::FrameContext;
use super::Pipeline;
use crate::error::{AnalysisError, AnalysisResult};
use crate::model::{Diagnostics, MediaRecord, Progress};
use crate::video::{self, cleanup_frame_dir, FrameSampler, TempFrame};

/// Caller-supplied knobs for one video run. Unset values fall back to the
/// configured defaults.
#[derive(Clone, Debug, Default)]
pub struct VideoOptions {
    pub frame_stride: Option<i64>,
    pub max_frames: Option<i64>,
    pub hint_item_ids: Vec<i64>,
}

impl Pipeline {
    /// Analyze sampled frames of a stored video, one Detection per frame.
    /// Returns the Detection ids in frame order.
    pub fn analyze_video(
        &mut self,
        media_id: i64,
        options: VideoOptions,
    ) -> AnalysisResult<Vec<i64>> {
        self.analyze_video_with(media_id, options, &mut |_| {})
    }

    /// Same as [`Pipeline::analyze_video`], reporting progress after each
    /// sampled frame.
    pub fn analyze_video_with(
        &mut self,
        media_id: i64,
        options: VideoOptions,
        on_frame: &mut dyn FnMut(&Progress),
    ) -> AnalysisResult<Vec<i64>> {
        let params = video::validate_video_params(
            options.frame_stride,
            options.max_frames,
            self.video_defaults,
        )?;
        let media = self.require_media(media_id)?;
        if !self.media.exists(&media.path) {
            return Err(AnalysisError::MediaUnreadable(format!(
                "media file not found: {}",
                self.media.resolve(&media.path).display()
            )));
        }
        let hints = self.validate_hints(&media, &options.hint_item_ids)?;
        if let Err(e) = self.ensure_media_hash(&media, None) {
            log::warn!("content hash of media {} unavailable: {:#}", media.id, e);
        }

        let source = video::open_source(&self.media.resolve(&media.path))
            .map_err(|e| AnalysisError::MediaUnreadable(format!("{:#}", e)))?;
        let mut sampler = FrameSampler::new(source, params);
        let expected_total = sampler.expected_total();
        let frame_dir = self.media.frame_dir();
        log::info!(
            "video {}: stride={} max_frames={} expected={}",
            media.id,
            params.frame_stride,
            params.max_frames,
            expected_total
        );

        let mut detection_ids = Vec::new();
        let mut stopped: Option<AnalysisError> = None;
        loop {
            let sample = match sampler.next_sample() {
                Ok(Some(sample)) => sample,
                Ok(None) => break,
                Err(e) => {
                    log::warn!(
                        "video {} decode stopped after {} frame(s): {:#}",
                        media.id,
                        detection_ids.len(),
                        e
                    );
                    if detection_ids.is_empty() {
                        cleanup_frame_dir(&frame_dir);
                        return Err(AnalysisError::MediaUnreadable(format!("{:#}", e)));
                    }
                    break;
                }
            };

            let progress = Progress {
                current: sample.ordinal,
                expected_total: expected_total.max(sample.ordinal),
            };
            let ctx = FrameContext {
                frame_index: Some(sample.index),
                progress: Some(progress),
                hints: &hints,
            };
            let detection_id = match self.begin_run(media.id, ctx) {
                Ok(id) => id,
                Err(e) => {
                    stopped = Some(e);
                    break;
                }
            };
            let mut diagnostics = Diagnostics::default();
            let result = TempFrame::write(&frame_dir, media.id, sample.index, &sample.image)
                .and_then(|frame| {
                    let image = frame.load()?;
                    self.run_frame(&media, &image, ctx, &mut diagnostics)
                        .with_context(|| format!("frame {}", sample.index))
                });
            if let Err(e) = self.finish_run(&media, detection_id, diagnostics, result) {
                stopped = Some(e);
                break;
            }
            detection_ids.push(detection_id);
            on_frame(&progress);
        }

        cleanup_frame_dir(&frame_dir);
        if let Some(e) = stopped {
            if detection_ids.is_empty() {
                return Err(e);
            }
            log::warn!(
                "video {} stopped after {} frame(s): {}",
                media.id,
                detection_ids.len(),
                e
            );
        }
        if detection_ids.is_empty() {
            return Err(AnalysisError::MediaUnreadable(format!(
                "video {} produced no frames",
                media.id
            )));
        }
        Ok(detection_ids)
    }

    /// Keep hint ids that name items of the media's workspace.
    fn validate_hints(&self, media: &MediaRecord, hints: &[i64]) -> AnalysisResult<Vec<i64>> {
        let mut kept = Vec::with_capacity(hints.len());
        for &item_id in hints {
            if kept.contains(&item_id) {
                continue;
            }
            match self.store.item_workspace(item_id)? {
                Some(workspace_id) if workspace_id == media.workspace_id => kept.push(item_id),
                Some(_) => log::warn!(
                    "hint item {} belongs to another workspace, dropped",
                    item_id
                ),
                None => log::warn!("hint item {} does not exist, dropped", item_id),
            }
        }
        Ok(kept)
    }
}
