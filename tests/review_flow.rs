//! Human review on completed detections: verdicts, per-object edits and the
//! append-only review log.

use std::path::Path;
use std::sync::Arc;

use image::{Rgb, RgbImage};
use serde_json::json;
use tempfile::TempDir;

use inventory_vision::detect::DetectorService;
use inventory_vision::embed::{EmbeddingService, HistogramEmbedder};
use inventory_vision::model::{
    Decision, Detection, DetectionStatus, MediaType, ObjectUpdate, ReviewAction, ReviewRequest,
};
use inventory_vision::store::{NewMedia, NewUpload};
use inventory_vision::{AnalysisError, FilesystemMediaStore, Pipeline, PipelineConfig, Store};

const WORKSPACE: i64 = 3;
const OWNER: i64 = 30;
const REVIEWER: i64 = 31;

struct Fixture {
    _dir: TempDir,
    pipeline: Pipeline,
    media_id: i64,
    detection: Detection,
}

fn analyzed_photo() -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut cfg = PipelineConfig::defaults();
    cfg.db_path = inventory_vision::shared_memory_uri();
    cfg.media.public_root = dir.path().join("public");
    cfg.media.private_root = dir.path().join("private");

    let store = Store::open(&cfg.db_path).unwrap();
    let mut pipeline = Pipeline::new(
        store,
        Box::new(FilesystemMediaStore::new(&cfg.media)),
        Arc::new(DetectorService::unavailable("no model in tests", 0.25)),
        Arc::new(EmbeddingService::with_backend(HistogramEmbedder::new())),
        &cfg,
    );

    write_photo(&cfg.media.public_root, "shelf/kettle.png");
    let media_id = pipeline
        .store_mut()
        .insert_media(&NewMedia::new(WORKSPACE, OWNER, MediaType::Photo, "shelf/kettle.png"))
        .unwrap();
    let detection = pipeline.analyze(media_id).unwrap();
    assert_eq!(detection.status, DetectionStatus::Done);

    Fixture {
        _dir: dir,
        pipeline,
        media_id,
        detection,
    }
}

fn write_photo(root: &Path, rel: &str) {
    let image = RgbImage::from_fn(48, 48, |x, y| {
        if (10..30).contains(&x) && (14..34).contains(&y) {
            Rgb([240, 240, 240])
        } else {
            Rgb([8, 8, 8])
        }
    });
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    image.save(path).unwrap();
}

#[test]
fn accepting_twice_logs_twice_and_stays_done() {
    let mut fx = analyzed_photo();
    let location = fx
        .pipeline
        .store_mut()
        .insert_location(WORKSPACE, "Kitchen")
        .unwrap();
    let item = fx
        .pipeline
        .store_mut()
        .insert_item(WORKSPACE, OWNER, "Kettle", Some(location))
        .unwrap();
    let request = ReviewRequest {
        item_id: Some(item),
        location_id: Some(location),
    };

    let first = fx
        .pipeline
        .accept(fx.detection.id, request, Some(REVIEWER))
        .unwrap();
    let second = fx.pipeline.accept(fx.detection.id, request, None).unwrap();

    assert_eq!(first.status, DetectionStatus::Done);
    assert_eq!(second.status, DetectionStatus::Done);
    for object in &second.objects {
        assert_eq!(object.decision, Decision::Accepted);
        assert_eq!(object.item_id, Some(item));
        assert_eq!(object.location_id, Some(location));
        assert!(object.decided_at.is_some());
    }

    let log = fx.pipeline.review_log(fx.detection.id).unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|entry| entry.action == ReviewAction::Accept));
    assert_eq!(log[0].actor_id, Some(REVIEWER));
    assert_eq!(log[0].payload["item_id"], item);
}

#[test]
fn reject_without_body_rejects_every_object() {
    let mut fx = analyzed_photo();

    let rejected = fx.pipeline.reject(fx.detection.id, None, None).unwrap();

    assert_eq!(rejected.status, DetectionStatus::Failed);
    assert!(rejected.completed_at.is_some());
    assert!(!rejected.objects.is_empty());
    for object in &rejected.objects {
        assert_eq!(object.decision, Decision::Rejected);
        assert!(object.decided_at.is_some());
    }

    let log = fx.pipeline.review_log(fx.detection.id).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, ReviewAction::Reject);
    assert_eq!(log[0].payload, json!({}));
}

#[test]
fn verdict_with_unknown_links_changes_nothing() {
    let mut fx = analyzed_photo();

    let err = fx
        .pipeline
        .accept(
            fx.detection.id,
            ReviewRequest {
                item_id: Some(9_999),
                location_id: None,
            },
            None,
        )
        .unwrap_err();
    assert!(matches!(err, AnalysisError::NotFound { kind: "item", .. }));

    let err = fx.pipeline.reject(77_777, None, None).unwrap_err();
    assert!(matches!(err, AnalysisError::NotFound { kind: "detection", .. }));

    let unchanged = fx.pipeline.detection(fx.detection.id).unwrap();
    assert_eq!(unchanged, fx.detection);
    assert!(fx.pipeline.review_log(fx.detection.id).unwrap().is_empty());
}

#[test]
fn object_update_leaves_parent_completion_alone() {
    let mut fx = analyzed_photo();
    let item = fx
        .pipeline
        .store_mut()
        .insert_item(WORKSPACE, OWNER, "Kettle", None)
        .unwrap();
    let object_id = fx.detection.objects[0].id;

    let updated = fx
        .pipeline
        .update_object(
            object_id,
            ObjectUpdate {
                item_id: Some(item),
                location_id: None,
                decision: Some(Decision::Accepted),
            },
            Some(REVIEWER),
        )
        .unwrap();

    assert_eq!(updated.item_id, Some(item));
    assert_eq!(updated.decision, Decision::Accepted);
    assert_eq!(updated.decided_by, Some(REVIEWER));
    assert!(updated.decided_at.is_some());

    let parent = fx.pipeline.detection(fx.detection.id).unwrap();
    assert_eq!(parent.status, fx.detection.status);
    assert_eq!(parent.completed_at, fx.detection.completed_at);

    let err = fx
        .pipeline
        .update_object(123_456, ObjectUpdate::default(), None)
        .unwrap_err();
    assert!(matches!(err, AnalysisError::NotFound { kind: "detection_object", .. }));
}

#[test]
fn log_only_review_keeps_status() {
    let mut fx = analyzed_photo();

    fx.pipeline
        .log_review(
            fx.detection.id,
            ReviewAction::FixLocation,
            json!({"location_id": 5, "note": "moved to pantry"}),
            Some(REVIEWER),
        )
        .unwrap();

    let detection = fx.pipeline.detection(fx.detection.id).unwrap();
    assert_eq!(detection.status, DetectionStatus::Done);
    let log = fx.pipeline.review_log(fx.detection.id).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, ReviewAction::FixLocation);
    assert_eq!(log[0].payload["note"], "moved to pantry");

    let err = fx
        .pipeline
        .log_review(88_888, ReviewAction::Accept, json!({}), None)
        .unwrap_err();
    assert!(err.is_client_error());
}

#[test]
fn verdicts_are_mirrored_into_the_upload() {
    let mut fx = analyzed_photo();
    let upload_id = fx
        .pipeline
        .begin_upload(&NewUpload {
            media_id: Some(fx.media_id),
            workspace_id: WORKSPACE,
            owner_user_id: OWNER,
            location_id: None,
            media_type: MediaType::Photo,
            source: None,
            path: None,
            thumb_path: None,
        })
        .unwrap();

    fx.pipeline.reject(fx.detection.id, None, None).unwrap();

    let upload = fx.pipeline.upload(upload_id).unwrap();
    assert_eq!(upload.ai_status.as_deref(), Some("failed"));
    assert_eq!(upload.detection_id, Some(fx.detection.id));
    let summary = upload.ai_summary.unwrap();
    assert!(summary["objects"]
        .as_array()
        .unwrap()
        .iter()
        .all(|o| o["decision"] == "rejected"));
}

#[test]
fn verdict_on_an_older_run_keeps_the_newest_mirrored() {
    let mut fx = analyzed_photo();
    let newer = fx.pipeline.analyze(fx.media_id).unwrap();
    assert!(newer.id > fx.detection.id);
    let upload_id = fx
        .pipeline
        .begin_upload(&NewUpload {
            media_id: Some(fx.media_id),
            workspace_id: WORKSPACE,
            owner_user_id: OWNER,
            location_id: None,
            media_type: MediaType::Photo,
            source: None,
            path: None,
            thumb_path: None,
        })
        .unwrap();

    fx.pipeline.reject(fx.detection.id, None, None).unwrap();

    let upload = fx.pipeline.upload(upload_id).unwrap();
    assert_eq!(upload.ai_status.as_deref(), Some("done"));
    assert_eq!(upload.detection_id, Some(newer.id));
    assert_eq!(
        fx.pipeline.detection(fx.detection.id).unwrap().status,
        DetectionStatus::Failed
    );
}
