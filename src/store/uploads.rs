use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::{now_i64, parse_column, Store};
use crate::model::{MediaType, ReviewAction, ReviewLogEntry, UploadHistoryEntry, UploadStatus};

/// Upload attempt to record.
#[derive(Clone, Debug)]
pub struct NewUpload {
    pub media_id: Option<i64>,
    pub workspace_id: i64,
    pub owner_user_id: i64,
    pub location_id: Option<i64>,
    pub media_type: MediaType,
    pub source: Option<String>,
    pub path: Option<String>,
    pub thumb_path: Option<String>,
}

const UPLOAD_COLUMNS: &str = "id, media_id, detection_id, workspace_id, owner_user_id, location_id, media_type, status, source, ai_status, ai_summary_json, path, thumb_path, created_at, updated_at";

struct UploadRow {
    id: i64,
    media_id: Option<i64>,
    detection_id: Option<i64>,
    workspace_id: i64,
    owner_user_id: i64,
    location_id: Option<i64>,
    media_type: String,
    status: String,
    source: Option<String>,
    ai_status: Option<String>,
    ai_summary_json: Option<String>,
    path: Option<String>,
    thumb_path: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn read_upload_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadRow> {
    Ok(UploadRow {
        id: row.get(0)?,
        media_id: row.get(1)?,
        detection_id: row.get(2)?,
        workspace_id: row.get(3)?,
        owner_user_id: row.get(4)?,
        location_id: row.get(5)?,
        media_type: row.get(6)?,
        status: row.get(7)?,
        source: row.get(8)?,
        ai_status: row.get(9)?,
        ai_summary_json: row.get(10)?,
        path: row.get(11)?,
        thumb_path: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl UploadRow {
    fn into_entry(self) -> Result<UploadHistoryEntry> {
        let ai_summary = match self.ai_summary_json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(UploadHistoryEntry {
            id: self.id,
            media_id: self.media_id,
            detection_id: self.detection_id,
            workspace_id: self.workspace_id,
            owner_user_id: self.owner_user_id,
            location_id: self.location_id,
            media_type: parse_column(&self.media_type, "upload_history.media_type")?,
            status: parse_column(&self.status, "upload_history.status")?,
            source: self.source,
            ai_status: self.ai_status,
            ai_summary,
            path: self.path,
            thumb_path: self.thumb_path,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl Store {
    // -------------------- Review log --------------------

    pub fn append_review(
        &mut self,
        detection_id: i64,
        actor_id: Option<i64>,
        action: ReviewAction,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO review_log(detection_id, actor_id, action, payload_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                detection_id,
                actor_id,
                action.as_str(),
                serde_json::to_string(payload)?,
                now_i64()?
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn review_log(&self, detection_id: i64) -> Result<Vec<ReviewLogEntry>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT id, detection_id, actor_id, action, payload_json, created_at
                FROM review_log
                WHERE detection_id = ?1
                ORDER BY id ASC
                "#,
            )?;
            let rows = stmt.query_map(params![detection_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter()
            .map(|(id, detection_id, actor_id, action, payload, created_at)| {
                Ok(ReviewLogEntry {
                    id,
                    detection_id,
                    actor_id,
                    action: parse_column(&action, "review_log.action")?,
                    payload: serde_json::from_str(&payload)?,
                    created_at,
                })
            })
            .collect()
    }

    // -------------------- Upload history --------------------

    pub fn insert_upload(&mut self, upload: &NewUpload) -> Result<i64> {
        let now = now_i64()?;
        self.conn.execute(
            r#"
            INSERT INTO upload_history(
                media_id, workspace_id, owner_user_id, location_id, media_type,
                status, source, path, thumb_path, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            "#,
            params![
                upload.media_id,
                upload.workspace_id,
                upload.owner_user_id,
                upload.location_id,
                upload.media_type.as_str(),
                UploadStatus::Pending.as_str(),
                upload.source,
                upload.path,
                upload.thumb_path,
                now
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn upload(&self, upload_id: i64) -> Result<Option<UploadHistoryEntry>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM upload_history WHERE id = ?1", UPLOAD_COLUMNS),
                params![upload_id],
                read_upload_row,
            )
            .optional()?;
        row.map(UploadRow::into_entry).transpose()
    }

    /// Most recent upload attempt for the media.
    pub fn latest_upload_for_media(&self, media_id: i64) -> Result<Option<UploadHistoryEntry>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM upload_history WHERE media_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
                    UPLOAD_COLUMNS
                ),
                params![media_id],
                read_upload_row,
            )
            .optional()?;
        row.map(UploadRow::into_entry).transpose()
    }

    pub fn set_upload_status(&mut self, upload_id: i64, status: UploadStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE upload_history SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_i64()?, upload_id],
        )?;
        Ok(())
    }

    /// Overwrite the mirrored AI summary of one upload row.
    pub fn mirror_ai_summary(
        &mut self,
        upload_id: i64,
        detection_id: Option<i64>,
        ai_status: &str,
        summary: &serde_json::Value,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE upload_history
            SET detection_id = COALESCE(?1, detection_id),
                ai_status = ?2,
                ai_summary_json = ?3,
                updated_at = ?4
            WHERE id = ?5
            "#,
            params![
                detection_id,
                ai_status,
                serde_json::to_string(summary)?,
                now_i64()?,
                upload_id
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(media_id: Option<i64>) -> NewUpload {
        NewUpload {
            media_id,
            workspace_id: 1,
            owner_user_id: 1,
            location_id: None,
            media_type: MediaType::Photo,
            source: Some("mobile".into()),
            path: Some("uploads/a.jpg".into()),
            thumb_path: None,
        }
    }

    #[test]
    fn latest_upload_prefers_highest_id_within_same_second() {
        let mut store = Store::open(":memory:").unwrap();
        let older = store.insert_upload(&upload(Some(9))).unwrap();
        let newer = store.insert_upload(&upload(Some(9))).unwrap();
        assert!(newer > older);
        let latest = store.latest_upload_for_media(9).unwrap().unwrap();
        assert_eq!(latest.id, newer);
        assert_eq!(latest.status, UploadStatus::Pending);
        assert!(store.latest_upload_for_media(10).unwrap().is_none());
    }

    #[test]
    fn summary_is_overwritten() {
        let mut store = Store::open(":memory:").unwrap();
        let id = store.insert_upload(&upload(Some(1))).unwrap();
        store
            .mirror_ai_summary(id, Some(4), "in_progress", &serde_json::json!({"objects": []}))
            .unwrap();
        store
            .mirror_ai_summary(id, None, "done", &serde_json::json!({"objects": [1]}))
            .unwrap();
        let entry = store.upload(id).unwrap().unwrap();
        assert_eq!(entry.detection_id, Some(4));
        assert_eq!(entry.ai_status.as_deref(), Some("done"));
        assert_eq!(entry.ai_summary, Some(serde_json::json!({"objects": [1]})));
    }
}
