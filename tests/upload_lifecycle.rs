//! Upload attempts always end in a terminal status.

use std::sync::Arc;

use tempfile::TempDir;

use inventory_vision::detect::DetectorService;
use inventory_vision::embed::EmbeddingService;
use inventory_vision::model::{DetectionStatus, MediaType, UploadStatus};
use inventory_vision::store::{NewMedia, NewUpload};
use inventory_vision::{
    AnalysisError, FilesystemMediaStore, Pipeline, PipelineConfig, Store, VideoOptions,
};

const WORKSPACE: i64 = 2;
const OWNER: i64 = 20;

fn setup() -> (TempDir, Pipeline) {
    let dir = TempDir::new().unwrap();
    let mut cfg = PipelineConfig::defaults();
    cfg.db_path = inventory_vision::shared_memory_uri();
    cfg.media.public_root = dir.path().join("public");
    cfg.media.private_root = dir.path().join("private");
    let store = Store::open(&cfg.db_path).unwrap();
    let pipeline = Pipeline::new(
        store,
        Box::new(FilesystemMediaStore::new(&cfg.media)),
        Arc::new(DetectorService::unavailable("no model in tests", 0.25)),
        Arc::new(EmbeddingService::unavailable("no encoder in tests")),
        &cfg,
    );
    (dir, pipeline)
}

fn upload_for(media_id: Option<i64>, media_type: MediaType) -> NewUpload {
    NewUpload {
        media_id,
        workspace_id: WORKSPACE,
        owner_user_id: OWNER,
        location_id: None,
        media_type,
        source: Some("web".to_string()),
        path: None,
        thumb_path: None,
    }
}

#[test]
fn documents_and_opt_out_skip_analysis() {
    let (_dir, mut pipeline) = setup();
    let doc = pipeline
        .store_mut()
        .insert_media(&NewMedia::new(WORKSPACE, OWNER, MediaType::Document, "docs/receipt.pdf"))
        .unwrap();
    let upload_id = pipeline
        .begin_upload(&upload_for(Some(doc), MediaType::Document))
        .unwrap();
    assert_eq!(pipeline.upload(upload_id).unwrap().status, UploadStatus::Pending);

    let upload = pipeline
        .complete_upload(upload_id, true, VideoOptions::default())
        .unwrap();
    assert_eq!(upload.status, UploadStatus::Success);
    assert_eq!(upload.ai_status, None);
    assert!(pipeline.store().detection_ids_for_media(doc).unwrap().is_empty());

    let photo = pipeline
        .store_mut()
        .insert_media(&NewMedia::new(WORKSPACE, OWNER, MediaType::Photo, "items/later.png"))
        .unwrap();
    let upload_id = pipeline
        .begin_upload(&upload_for(Some(photo), MediaType::Photo))
        .unwrap();
    let upload = pipeline
        .complete_upload(upload_id, false, VideoOptions::default())
        .unwrap();
    assert_eq!(upload.status, UploadStatus::Success);
    assert!(pipeline.store().detection_ids_for_media(photo).unwrap().is_empty());
}

#[test]
fn unreadable_media_fails_the_upload_with_a_failed_detection() {
    let (_dir, mut pipeline) = setup();
    let media_id = pipeline
        .store_mut()
        .insert_media(&NewMedia::new(WORKSPACE, OWNER, MediaType::Photo, "items/gone.png"))
        .unwrap();
    let upload_id = pipeline
        .begin_upload(&upload_for(Some(media_id), MediaType::Photo))
        .unwrap();

    let upload = pipeline
        .complete_upload(upload_id, true, VideoOptions::default())
        .unwrap();

    assert_eq!(upload.status, UploadStatus::Failed);
    assert_eq!(upload.ai_status.as_deref(), Some("failed"));
    let detection_id = upload.detection_id.expect("failure recorded as a detection");
    let detection = pipeline.detection(detection_id).unwrap();
    assert_eq!(detection.status, DetectionStatus::Failed);
    assert!(detection
        .diagnostics
        .error
        .as_deref()
        .unwrap()
        .contains("media unreadable"));
    assert!(upload.ai_summary.unwrap()["error"].is_string());
}

#[test]
fn upload_without_media_records_the_error_in_its_summary() {
    let (_dir, mut pipeline) = setup();
    let upload_id = pipeline
        .begin_upload(&upload_for(None, MediaType::Photo))
        .unwrap();

    let upload = pipeline
        .complete_upload(upload_id, true, VideoOptions::default())
        .unwrap();

    assert_eq!(upload.status, UploadStatus::Failed);
    assert_eq!(upload.detection_id, None);
    let summary = upload.ai_summary.unwrap();
    assert_eq!(summary["status"], "failed");
    assert!(summary["error"].as_str().unwrap().contains("no media"));
}

#[test]
fn finished_or_unknown_uploads_are_refused() {
    let (_dir, mut pipeline) = setup();
    let upload_id = pipeline
        .begin_upload(&upload_for(None, MediaType::Document))
        .unwrap();
    pipeline
        .complete_upload(upload_id, true, VideoOptions::default())
        .unwrap();

    let err = pipeline
        .complete_upload(upload_id, true, VideoOptions::default())
        .unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidInput(_)));

    let err = pipeline
        .complete_upload(4_242, true, VideoOptions::default())
        .unwrap_err();
    assert!(matches!(err, AnalysisError::NotFound { kind: "upload", .. }));

    let err = pipeline
        .begin_upload(&upload_for(Some(5_151), MediaType::Photo))
        .unwrap_err();
    assert!(matches!(err, AnalysisError::NotFound { kind: "media", .. }));
}
