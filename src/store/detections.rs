use anyhow::{anyhow, Result};
use rusqlite::{params, OptionalExtension, Transaction};

use super::{now_i64, parse_column, Store};
use crate::matcher::ItemScore;
use crate::model::{
    BoundingBox, Decision, Detection, DetectionCandidate, DetectionObject, DetectionStatus,
    Diagnostics, ObjectUpdate, ReviewAction, ReviewRequest,
};

/// Object produced by one run, persisted together with its candidates.
#[derive(Clone, Debug)]
pub struct NewObject {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub suggested_location_id: Option<i64>,
    pub candidates: Vec<ItemScore>,
}

type DetectionRow = (i64, i64, String, String, i64, Option<i64>);

type ObjectRow = (
    i64,
    i64,
    String,
    f64,
    String,
    Option<i64>,
    String,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    i64,
);

const DETECTION_COLUMNS: &str = "id, media_id, status, raw_json, created_at, completed_at";

const OBJECT_COLUMNS: &str = "id, detection_id, label, confidence, bbox_json, suggested_location_id, decision, item_id, location_id, decided_by, decided_at, created_at";

fn read_detection_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DetectionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn read_object_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ObjectRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

impl Store {
    /// Insert a detection row. Commits immediately.
    pub fn create_detection(
        &mut self,
        media_id: i64,
        status: DetectionStatus,
        diagnostics: &Diagnostics,
    ) -> Result<i64> {
        let raw_json = serde_json::to_string(diagnostics)?;
        self.conn.execute(
            "INSERT INTO detections(media_id, status, raw_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![media_id, status.as_str(), raw_json, now_i64()?],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Write a run's objects, candidates and terminal status in one transaction.
    ///
    /// Only a `pending` or `in_progress` row is finished; returns `false` when
    /// the row was already terminal and nothing was written.
    pub fn finish_detection(
        &mut self,
        detection_id: i64,
        status: DetectionStatus,
        diagnostics: &Diagnostics,
        objects: &[NewObject],
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(anyhow!(
                "detection {} cannot finish as {}",
                detection_id,
                status
            ));
        }
        let now = now_i64()?;
        let raw_json = serde_json::to_string(diagnostics)?;
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            r#"
            UPDATE detections
            SET status = ?1, raw_json = ?2, completed_at = ?3
            WHERE id = ?4 AND status IN ('pending', 'in_progress')
            "#,
            params![status.as_str(), raw_json, now, detection_id],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        for object in objects {
            insert_object(&tx, detection_id, object, now)?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn detection(&self, detection_id: i64) -> Result<Option<Detection>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM detections WHERE id = ?1",
                    DETECTION_COLUMNS
                ),
                params![detection_id],
                read_detection_row,
            )
            .optional()?;
        match row {
            Some(row) => Ok(Some(self.assemble_detection(row)?)),
            None => Ok(None),
        }
    }

    pub fn detections_by_status(&self, status: DetectionStatus) -> Result<Vec<Detection>> {
        let rows = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {} FROM detections WHERE status = ?1 ORDER BY id ASC",
                DETECTION_COLUMNS
            ))?;
            let rows = stmt.query_map(params![status.as_str()], read_detection_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter()
            .map(|row| self.assemble_detection(row))
            .collect()
    }

    pub fn detection_ids_for_media(&self, media_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM detections WHERE media_id = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![media_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    /// Most recently created detection of the media.
    pub fn latest_detection_id(&self, media_id: i64) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM detections WHERE media_id = ?1 ORDER BY id DESC LIMIT 1",
                params![media_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// `in_progress` detections created at or before `cutoff` (epoch seconds).
    pub fn stale_in_progress(&self, cutoff: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM detections WHERE status = 'in_progress' AND created_at <= ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    /// Human verdict on a whole detection: status, every object's decision and
    /// one review log entry, committed together.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_verdict(
        &mut self,
        detection_id: i64,
        status: DetectionStatus,
        decision: Decision,
        links: &ReviewRequest,
        actor_id: Option<i64>,
        action: ReviewAction,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let now = now_i64()?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE detections SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, detection_id],
        )?;
        tx.execute(
            r#"
            UPDATE detection_objects
            SET decision = ?1,
                decided_at = ?2,
                decided_by = ?3,
                item_id = COALESCE(?4, item_id),
                location_id = COALESCE(?5, location_id)
            WHERE detection_id = ?6
            "#,
            params![
                decision.as_str(),
                now,
                actor_id,
                links.item_id,
                links.location_id,
                detection_id
            ],
        )?;
        tx.execute(
            "INSERT INTO review_log(detection_id, actor_id, action, payload_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                detection_id,
                actor_id,
                action.as_str(),
                serde_json::to_string(payload)?,
                now
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn detection_object(&self, object_id: i64) -> Result<Option<DetectionObject>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM detection_objects WHERE id = ?1",
                    OBJECT_COLUMNS
                ),
                params![object_id],
                read_object_row,
            )
            .optional()?;
        match row {
            Some(row) => Ok(Some(self.assemble_object(row)?)),
            None => Ok(None),
        }
    }

    /// Relink or redecide one object. The parent detection is untouched.
    pub fn update_object(
        &mut self,
        object_id: i64,
        update: &ObjectUpdate,
        actor_id: Option<i64>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE detection_objects
            SET item_id = COALESCE(?1, item_id),
                location_id = COALESCE(?2, location_id),
                decision = COALESCE(?3, decision),
                decided_by = COALESCE(?4, decided_by),
                decided_at = ?5
            WHERE id = ?6
            "#,
            params![
                update.item_id,
                update.location_id,
                update.decision.map(Decision::as_str),
                actor_id,
                now_i64()?,
                object_id
            ],
        )?;
        Ok(())
    }

    fn assemble_detection(&self, row: DetectionRow) -> Result<Detection> {
        let (id, media_id, status, raw_json, created_at, completed_at) = row;
        let diagnostics: Diagnostics = serde_json::from_str(&raw_json)?;
        let object_rows = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {} FROM detection_objects WHERE detection_id = ?1 ORDER BY id ASC",
                OBJECT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![id], read_object_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let objects = object_rows
            .into_iter()
            .map(|row| self.assemble_object(row))
            .collect::<Result<Vec<_>>>()?;
        Ok(Detection {
            id,
            media_id,
            status: parse_column(&status, "detections.status")?,
            diagnostics,
            created_at,
            completed_at,
            objects,
        })
    }

    fn assemble_object(&self, row: ObjectRow) -> Result<DetectionObject> {
        let (
            id,
            detection_id,
            label,
            confidence,
            bbox_json,
            suggested_location_id,
            decision,
            item_id,
            location_id,
            decided_by,
            decided_at,
            created_at,
        ) = row;
        Ok(DetectionObject {
            id,
            detection_id,
            label,
            confidence: confidence as f32,
            bbox: serde_json::from_str(&bbox_json)?,
            suggested_location_id,
            decision: parse_column(&decision, "detection_objects.decision")?,
            item_id,
            location_id,
            decided_by,
            decided_at,
            created_at,
            candidates: self.candidates_for(id)?,
        })
    }

    fn candidates_for(&self, object_id: i64) -> Result<Vec<DetectionCandidate>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, detection_object_id, item_id, score, created_at
            FROM detection_candidates
            WHERE detection_object_id = ?1
            ORDER BY score DESC, id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![object_id], |row| {
            Ok(DetectionCandidate {
                id: row.get(0)?,
                detection_object_id: row.get(1)?,
                item_id: row.get(2)?,
                score: row.get::<_, f64>(3)? as f32,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn insert_object(tx: &Transaction<'_>, detection_id: i64, object: &NewObject, now: i64) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO detection_objects(detection_id, label, confidence, bbox_json, suggested_location_id, decision, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
        "#,
        params![
            detection_id,
            object.label,
            object.confidence as f64,
            serde_json::to_string(&object.bbox)?,
            object.suggested_location_id,
            now
        ],
    )?;
    let object_id = tx.last_insert_rowid();
    for candidate in &object.candidates {
        tx.execute(
            "INSERT INTO detection_candidates(detection_object_id, item_id, score, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![object_id, candidate.item_id, candidate.score as f64, now],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaType;
    use crate::store::NewMedia;

    fn seeded() -> (Store, i64) {
        let mut store = Store::open(":memory:").unwrap();
        let media = store
            .insert_media(&NewMedia::new(1, 1, MediaType::Photo, "a.jpg"))
            .unwrap();
        (store, media)
    }

    fn cup() -> NewObject {
        NewObject {
            label: "cup".into(),
            confidence: 0.8,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0).unwrap(),
            suggested_location_id: None,
            candidates: vec![
                ItemScore { item_id: 5, score: 0.4 },
                ItemScore { item_id: 6, score: 0.9 },
            ],
        }
    }

    #[test]
    fn finished_detection_is_not_reopened() {
        let (mut store, media) = seeded();
        let id = store
            .create_detection(media, DetectionStatus::InProgress, &Diagnostics::default())
            .unwrap();
        assert!(store
            .finish_detection(id, DetectionStatus::Done, &Diagnostics::default(), &[cup()])
            .unwrap());
        assert!(!store
            .finish_detection(id, DetectionStatus::Failed, &Diagnostics::default(), &[cup()])
            .unwrap());

        let detection = store.detection(id).unwrap().unwrap();
        assert_eq!(detection.status, DetectionStatus::Done);
        assert!(detection.completed_at.is_some());
        assert_eq!(detection.objects.len(), 1);
        let candidates = &detection.objects[0].candidates;
        assert_eq!(candidates[0].item_id, 6);
        assert_eq!(candidates[1].item_id, 5);
    }

    #[test]
    fn latest_detection_is_the_last_created() {
        let (mut store, media) = seeded();
        assert_eq!(store.latest_detection_id(media).unwrap(), None);
        let first = store
            .create_detection(media, DetectionStatus::InProgress, &Diagnostics::default())
            .unwrap();
        let second = store
            .create_detection(media, DetectionStatus::InProgress, &Diagnostics::default())
            .unwrap();
        store
            .finish_detection(first, DetectionStatus::Failed, &Diagnostics::default(), &[])
            .unwrap();
        assert_eq!(store.latest_detection_id(media).unwrap(), Some(second));
    }

    #[test]
    fn finish_requires_terminal_status() {
        let (mut store, media) = seeded();
        let id = store
            .create_detection(media, DetectionStatus::InProgress, &Diagnostics::default())
            .unwrap();
        assert!(store
            .finish_detection(id, DetectionStatus::Pending, &Diagnostics::default(), &[])
            .is_err());
    }

    #[test]
    fn verdict_updates_every_object() {
        let (mut store, media) = seeded();
        let id = store
            .create_detection(media, DetectionStatus::InProgress, &Diagnostics::default())
            .unwrap();
        store
            .finish_detection(id, DetectionStatus::Done, &Diagnostics::default(), &[cup(), cup()])
            .unwrap();
        store
            .apply_verdict(
                id,
                DetectionStatus::Failed,
                Decision::Rejected,
                &ReviewRequest::default(),
                Some(3),
                ReviewAction::Reject,
                &serde_json::json!({}),
            )
            .unwrap();
        let detection = store.detection(id).unwrap().unwrap();
        assert_eq!(detection.status, DetectionStatus::Failed);
        for object in &detection.objects {
            assert_eq!(object.decision, Decision::Rejected);
            assert_eq!(object.decided_by, Some(3));
            assert!(object.decided_at.is_some());
        }
        assert_eq!(store.review_log(id).unwrap().len(), 1);
    }
}
