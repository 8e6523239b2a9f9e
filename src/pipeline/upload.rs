use anyhow::Result;
use serde_json::json;

use super::{Pipeline, VideoOptions};
use crate::error::{AnalysisError, AnalysisResult};
use crate::model::{DetectionStatus, Diagnostics, MediaType, UploadHistoryEntry, UploadStatus};
use crate::store::NewUpload;

impl Pipeline {
    /// Record a new upload attempt as `pending`.
    pub fn begin_upload(&mut self, upload: &NewUpload) -> AnalysisResult<i64> {
        if let Some(media_id) = upload.media_id {
            self.require_media(media_id)?;
        }
        let upload_id = self.store.insert_upload(upload)?;
        log::debug!("upload {} recorded ({})", upload_id, upload.media_type.as_str());
        Ok(upload_id)
    }

    pub fn upload(&self, upload_id: i64) -> AnalysisResult<UploadHistoryEntry> {
        self.store
            .upload(upload_id)?
            .ok_or_else(|| AnalysisError::not_found("upload", upload_id))
    }

    /// Drive an upload to `success` or `failed`.
    ///
    /// Photos go through [`Pipeline::analyze`] and videos through
    /// [`Pipeline::analyze_video`]; documents, or `analyze == false`, skip
    /// analysis. The upload is `failed` only when analysis itself returned an
    /// error; a run that finished as a `failed` Detection still counts as a
    /// completed upload and is visible through `ai_status`.
    pub fn complete_upload(
        &mut self,
        upload_id: i64,
        analyze: bool,
        options: VideoOptions,
    ) -> AnalysisResult<UploadHistoryEntry> {
        let upload = self.upload(upload_id)?;
        if upload.status.is_terminal() {
            return Err(AnalysisError::InvalidInput(format!(
                "upload {} is already {}",
                upload_id,
                upload.status.as_str()
            )));
        }
        self.store
            .set_upload_status(upload_id, UploadStatus::InProgress)?;

        let outcome = match (analyze, upload.media_type, upload.media_id) {
            (false, _, _) | (_, MediaType::Document, _) => Ok(()),
            (true, _, None) => Err(AnalysisError::InvalidInput(format!(
                "upload {} has no media to analyze",
                upload_id
            ))),
            (true, MediaType::Photo, Some(media_id)) => self.analyze(media_id).map(|_| ()),
            (true, MediaType::Video, Some(media_id)) => {
                self.analyze_video(media_id, options).map(|_| ())
            }
        };

        let status = match outcome {
            Ok(()) => UploadStatus::Success,
            Err(e) => {
                log::warn!("upload {} analysis failed: {}", upload_id, e);
                if let Err(record_err) = self.record_upload_failure(&upload, &e.to_string()) {
                    log::error!(
                        "failure of upload {} could not be recorded: {:#}",
                        upload_id,
                        record_err
                    );
                }
                UploadStatus::Failed
            }
        };
        self.store.set_upload_status(upload_id, status)?;
        log::info!("upload {} finished: {}", upload_id, status.as_str());
        self.upload(upload_id)
    }

    /// Leave a failed Detection behind when the media exists; otherwise put
    /// the message straight into the upload's summary.
    fn record_upload_failure(&mut self, upload: &UploadHistoryEntry, message: &str) -> Result<()> {
        let media_id = match upload.media_id {
            Some(media_id) if self.store.media(media_id)?.is_some() => media_id,
            _ => {
                return self.store.mirror_ai_summary(
                    upload.id,
                    None,
                    DetectionStatus::Failed.as_str(),
                    &json!({"status": DetectionStatus::Failed.as_str(), "error": message}),
                );
            }
        };
        let mut diagnostics = Diagnostics::default();
        let detection_id =
            self.store
                .create_detection(media_id, DetectionStatus::InProgress, &diagnostics)?;
        diagnostics.error = Some(message.to_string());
        self.store
            .finish_detection(detection_id, DetectionStatus::Failed, &diagnostics, &[])?;
        self.reconcile_detection(detection_id)
    }
}
