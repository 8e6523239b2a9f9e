//! Pipeline aggregates and their value types.
//!
//! - `Detection`: one analysis run over one image or one sampled video frame.
//! - `DetectionObject`: one localized region with a label and a human decision.
//! - `DetectionCandidate`: one ranked inventory-item suggestion for an object.
//! - `ReviewLogEntry`: append-only audit record of a human action.
//! - `UploadHistoryEntry`: one upload attempt plus the mirrored latest AI summary.
//!
//! Timestamps are epoch seconds.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// -------------------- Enums --------------------

/// Detection state machine: `pending -> in_progress -> {done, failed}`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl DetectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl FromStr for DetectionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow!("unknown detection status '{}'", other)),
        }
    }
}

impl fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for Decision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(anyhow!("unknown decision '{}'", other)),
        }
    }
}

/// Human review actions recorded in the review log.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Accept,
    Reject,
    LinkExisting,
    CreateNew,
    FixLocation,
}

impl ReviewAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::LinkExisting => "link_existing",
            Self::CreateNew => "create_new",
            Self::FixLocation => "fix_location",
        }
    }
}

impl FromStr for ReviewAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "accept" => Ok(Self::Accept),
            "reject" => Ok(Self::Reject),
            "link_existing" => Ok(Self::LinkExisting),
            "create_new" => Ok(Self::CreateNew),
            "fix_location" => Ok(Self::FixLocation),
            other => Err(anyhow!("unknown review action '{}'", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl FromStr for UploadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow!("unknown upload status '{}'", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Photo,
    Video,
    Document,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
        }
    }
}

impl FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "photo" => Ok(Self::Photo),
            "video" => Ok(Self::Video),
            "document" => Ok(Self::Document),
            other => Err(anyhow!(
                "unsupported media type '{}'; allowed: photo, video, document",
                other
            )),
        }
    }
}

// -------------------- Geometry --------------------

/// Pixel-space bounding box with `x1 < x2` and `y1 < y2`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Result<Self> {
        if !(x1.is_finite() && y1.is_finite() && x2.is_finite() && y2.is_finite()) {
            return Err(anyhow!("bounding box coordinates must be finite"));
        }
        if x1 >= x2 || y1 >= y2 {
            return Err(anyhow!(
                "degenerate bounding box ({}, {}, {}, {})",
                x1,
                y1,
                x2,
                y2
            ));
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            x1: 0.0,
            y1: 0.0,
            x2: width.max(1) as f32,
            y2: height.max(1) as f32,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Clip to image bounds. Returns `None` when nothing of the box remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Self> {
        let w = width as f32;
        let h = height as f32;
        let clipped = Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        };
        if clipped.x1 < clipped.x2 && clipped.y1 < clipped.y2 {
            Some(clipped)
        } else {
            None
        }
    }

    /// Integer crop rectangle `(x, y, width, height)` covering the box.
    pub fn crop_rect(&self) -> (u32, u32, u32, u32) {
        let x = self.x1.floor().max(0.0) as u32;
        let y = self.y1.floor().max(0.0) as u32;
        let x2 = self.x2.ceil().max(0.0) as u32;
        let y2 = self.y2.ceil().max(0.0) as u32;
        (x, y, x2.saturating_sub(x).max(1), y2.saturating_sub(y).max(1))
    }

    pub fn iou(&self, other: &Self) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

// -------------------- Diagnostics --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub current: u64,
    pub expected_total: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ObjectSnapshot {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Semi-structured diagnostic payload stored with each Detection.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Diagnostics {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector: Option<String>,
    #[serde(default)]
    pub objects: Vec<ObjectSnapshot>,
}

impl Diagnostics {
    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }
}

// -------------------- Aggregates --------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectionCandidate {
    pub id: i64,
    pub detection_object_id: i64,
    pub item_id: i64,
    pub score: f32,
    pub created_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectionObject {
    pub id: i64,
    pub detection_id: i64,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub suggested_location_id: Option<i64>,
    pub decision: Decision,
    pub item_id: Option<i64>,
    pub location_id: Option<i64>,
    pub decided_by: Option<i64>,
    pub decided_at: Option<i64>,
    pub created_at: i64,
    pub candidates: Vec<DetectionCandidate>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub id: i64,
    pub media_id: i64,
    pub status: DetectionStatus,
    pub diagnostics: Diagnostics,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub objects: Vec<DetectionObject>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReviewLogEntry {
    pub id: i64,
    pub detection_id: i64,
    pub actor_id: Option<i64>,
    pub action: ReviewAction,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UploadHistoryEntry {
    pub id: i64,
    pub media_id: Option<i64>,
    pub detection_id: Option<i64>,
    pub workspace_id: i64,
    pub owner_user_id: i64,
    pub location_id: Option<i64>,
    pub media_type: MediaType,
    pub status: UploadStatus,
    pub source: Option<String>,
    pub ai_status: Option<String>,
    pub ai_summary: Option<serde_json::Value>,
    pub path: Option<String>,
    pub thumb_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Stored media metadata read from the catalog.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MediaRecord {
    pub id: i64,
    pub workspace_id: i64,
    pub owner_user_id: i64,
    pub location_id: Option<i64>,
    pub media_type: MediaType,
    pub path: String,
    pub mime_type: Option<String>,
    pub file_hash: Option<String>,
}

/// Optional links supplied with an accept/reject action.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewRequest {
    pub item_id: Option<i64>,
    pub location_id: Option<i64>,
}

/// Per-object relink/redecide request.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectUpdate {
    pub item_id: Option<i64>,
    pub location_id: Option<i64>,
    pub decision: Option<Decision>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            DetectionStatus::Pending,
            DetectionStatus::InProgress,
            DetectionStatus::Done,
            DetectionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DetectionStatus>().unwrap(), status);
        }
        assert!("reopened".parse::<DetectionStatus>().is_err());
        assert!(DetectionStatus::Done.is_terminal());
        assert!(!DetectionStatus::InProgress.is_terminal());
    }

    #[test]
    fn review_action_uses_link_existing_wire_name() {
        let json = serde_json::to_string(&ReviewAction::LinkExisting).unwrap();
        assert_eq!(json, "\"link_existing\"");
        assert_eq!(
            "fix_location".parse::<ReviewAction>().unwrap(),
            ReviewAction::FixLocation
        );
    }

    #[test]
    fn bounding_box_rejects_degenerate_coordinates() {
        assert!(BoundingBox::new(10.0, 0.0, 10.0, 5.0).is_err());
        assert!(BoundingBox::new(0.0, 8.0, 4.0, 2.0).is_err());
        assert!(BoundingBox::new(0.0, 0.0, f32::NAN, 1.0).is_err());
        let bbox = BoundingBox::new(1.0, 2.0, 5.0, 6.0).unwrap();
        assert_eq!(bbox.area(), 16.0);
    }

    #[test]
    fn bounding_box_clamps_and_crops() {
        let bbox = BoundingBox::new(-5.0, -5.0, 20.5, 8.2).unwrap();
        let clipped = bbox.clamp_to(10, 10).unwrap();
        assert_eq!(clipped, BoundingBox::new(0.0, 0.0, 10.0, 8.2).unwrap());
        assert_eq!(clipped.crop_rect(), (0, 0, 10, 9));

        let outside = BoundingBox::new(20.0, 20.0, 30.0, 30.0).unwrap();
        assert!(outside.clamp_to(10, 10).is_none());
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = BoundingBox::new(0.0, 0.0, 4.0, 4.0).unwrap();
        let b = BoundingBox::new(2.0, 0.0, 6.0, 4.0).unwrap();
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn diagnostics_deduplicate_warnings() {
        let mut diagnostics = Diagnostics::default();
        diagnostics.warn("embedder_unavailable");
        diagnostics.warn("embedder_unavailable");
        assert_eq!(diagnostics.warnings.len(), 1);

        let json = serde_json::to_value(&diagnostics).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["objects"], serde_json::json!([]));
    }
}
