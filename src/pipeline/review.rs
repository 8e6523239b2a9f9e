use serde_json::Value;

use super::Pipeline;
use crate::error::{AnalysisError, AnalysisResult};
use crate::model::{
    Decision, Detection, DetectionObject, DetectionStatus, ObjectUpdate, ReviewAction,
    ReviewRequest,
};

impl Pipeline {
    /// Accept every object of a detection and mark it `done`.
    pub fn accept(
        &mut self,
        detection_id: i64,
        request: ReviewRequest,
        actor_id: Option<i64>,
    ) -> AnalysisResult<Detection> {
        let payload = serde_json::to_value(request)?;
        self.apply_verdict(
            detection_id,
            DetectionStatus::Done,
            Decision::Accepted,
            request,
            actor_id,
            ReviewAction::Accept,
            payload,
        )
    }

    /// Reject every object of a detection and mark it `failed`.
    /// Without a request body the logged payload is `{}`.
    pub fn reject(
        &mut self,
        detection_id: i64,
        request: Option<ReviewRequest>,
        actor_id: Option<i64>,
    ) -> AnalysisResult<Detection> {
        let payload = match request {
            Some(request) => serde_json::to_value(request)?,
            None => Value::Object(Default::default()),
        };
        self.apply_verdict(
            detection_id,
            DetectionStatus::Failed,
            Decision::Rejected,
            request.unwrap_or_default(),
            actor_id,
            ReviewAction::Reject,
            payload,
        )
    }

    /// Relink or redecide a single object. The parent's status and
    /// completion time stay as they are.
    pub fn update_object(
        &mut self,
        object_id: i64,
        update: ObjectUpdate,
        actor_id: Option<i64>,
    ) -> AnalysisResult<DetectionObject> {
        let object = self
            .store
            .detection_object(object_id)?
            .ok_or_else(|| AnalysisError::not_found("detection_object", object_id))?;
        self.require_links(update.item_id, update.location_id)?;
        self.store.update_object(object_id, &update, actor_id)?;
        self.reconcile_detection(object.detection_id)?;
        self.store
            .detection_object(object_id)?
            .ok_or_else(|| AnalysisError::not_found("detection_object", object_id))
    }

    /// Append a review log entry without touching the detection.
    pub fn log_review(
        &mut self,
        detection_id: i64,
        action: ReviewAction,
        payload: Value,
        actor_id: Option<i64>,
    ) -> AnalysisResult<()> {
        self.detection(detection_id)?;
        self.store
            .append_review(detection_id, actor_id, action, &payload)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_verdict(
        &mut self,
        detection_id: i64,
        status: DetectionStatus,
        decision: Decision,
        request: ReviewRequest,
        actor_id: Option<i64>,
        action: ReviewAction,
        payload: Value,
    ) -> AnalysisResult<Detection> {
        self.detection(detection_id)?;
        self.require_links(request.item_id, request.location_id)?;
        self.store.apply_verdict(
            detection_id,
            status,
            decision,
            &request,
            actor_id,
            action,
            &payload,
        )?;
        log::info!("detection {} reviewed: {}", detection_id, action.as_str());
        self.reconcile_detection(detection_id)?;
        self.detection(detection_id)
    }
}
