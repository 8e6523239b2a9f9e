use anyhow::Result;
use serde_json::{json, Value};

use super::Pipeline;
use crate::model::Detection;

impl Pipeline {
    /// Mirror the newest Detection of the changed one's media into the most
    /// recent upload row of that media. No upload row means nothing to do.
    pub(super) fn reconcile_detection(&mut self, detection_id: i64) -> Result<()> {
        let Some(changed) = self.store.detection(detection_id)? else {
            return Ok(());
        };
        let Some(upload) = self.store.latest_upload_for_media(changed.media_id)? else {
            return Ok(());
        };
        let detection = match self.store.latest_detection_id(changed.media_id)? {
            Some(latest) if latest != changed.id => match self.store.detection(latest)? {
                Some(latest) => latest,
                None => changed,
            },
            _ => changed,
        };
        if detection.id != detection_id {
            log::debug!(
                "detection {} is not the newest for media {}, mirroring {}",
                detection_id,
                detection.media_id,
                detection.id
            );
        }
        self.store.mirror_ai_summary(
            upload.id,
            Some(detection.id),
            detection.status.as_str(),
            &ai_summary(&detection),
        )?;
        log::debug!(
            "upload {} mirrors detection {} ({})",
            upload.id,
            detection.id,
            detection.status
        );
        Ok(())
    }

    /// Reconcile after an analysis step, where the run result must still be
    /// returned even if the mirror cannot be written.
    pub(super) fn reconcile_best_effort(&mut self, detection_id: i64) {
        if let Err(e) = self.reconcile_detection(detection_id) {
            log::warn!(
                "upload history not updated for detection {}: {:#}",
                detection_id,
                e
            );
        }
    }
}

/// Denormalized snapshot stored on the upload row.
pub fn ai_summary(detection: &Detection) -> Value {
    let objects: Vec<Value> = detection
        .objects
        .iter()
        .map(|object| {
            json!({
                "id": object.id,
                "label": object.label,
                "confidence": object.confidence,
                "bbox": object.bbox,
                "decision": object.decision,
                "item_id": object.item_id,
                "location_id": object.location_id,
                "candidates": object
                    .candidates
                    .iter()
                    .map(|c| json!({"item_id": c.item_id, "score": c.score}))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    let mut summary = json!({
        "detection_id": detection.id,
        "status": detection.status,
        "objects": objects,
    });
    if !detection.diagnostics.warnings.is_empty() {
        summary["warnings"] = json!(detection.diagnostics.warnings);
    }
    if let Some(error) = &detection.diagnostics.error {
        summary["error"] = json!(error);
    }
    if let Some(progress) = detection.diagnostics.progress {
        summary["progress"] = json!(progress);
    }
    summary
}
