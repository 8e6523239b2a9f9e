use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::{now_i64, parse_column, Store};
use crate::model::{MediaRecord, MediaType};

/// Media row to insert.
#[derive(Clone, Debug)]
pub struct NewMedia {
    pub workspace_id: i64,
    pub owner_user_id: i64,
    pub location_id: Option<i64>,
    pub media_type: MediaType,
    pub path: String,
    pub mime_type: Option<String>,
    pub file_hash: Option<String>,
}

impl NewMedia {
    pub fn new(workspace_id: i64, owner_user_id: i64, media_type: MediaType, path: &str) -> Self {
        Self {
            workspace_id,
            owner_user_id,
            location_id: None,
            media_type,
            path: path.to_string(),
            mime_type: None,
            file_hash: None,
        }
    }

    pub fn at_location(mut self, location_id: i64) -> Self {
        self.location_id = Some(location_id);
        self
    }

    pub fn with_hash(mut self, file_hash: &str) -> Self {
        self.file_hash = Some(file_hash.to_string());
        self
    }
}

/// One item of the similarity pool. `embedding` is `None` when the item has
/// not been embedded yet.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolEntry {
    pub item_id: i64,
    pub embedding: Option<Vec<f32>>,
}

type MediaRow = (
    i64,
    i64,
    i64,
    Option<i64>,
    String,
    String,
    Option<String>,
    Option<String>,
);

const MEDIA_COLUMNS: &str =
    "id, workspace_id, owner_user_id, location_id, media_type, path, mime_type, file_hash";

fn media_from_row(row: MediaRow) -> Result<MediaRecord> {
    let (id, workspace_id, owner_user_id, location_id, media_type, path, mime_type, file_hash) =
        row;
    Ok(MediaRecord {
        id,
        workspace_id,
        owner_user_id,
        location_id,
        media_type: parse_column(&media_type, "media.media_type")?,
        path,
        mime_type,
        file_hash,
    })
}

fn read_media_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

impl Store {
    pub fn insert_media(&mut self, media: &NewMedia) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO media(workspace_id, owner_user_id, location_id, media_type, path, mime_type, file_hash, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                media.workspace_id,
                media.owner_user_id,
                media.location_id,
                media.media_type.as_str(),
                media.path,
                media.mime_type,
                media.file_hash,
                now_i64()?,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn media(&self, media_id: i64) -> Result<Option<MediaRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM media WHERE id = ?1", MEDIA_COLUMNS),
                params![media_id],
                read_media_row,
            )
            .optional()?;
        row.map(media_from_row).transpose()
    }

    pub fn set_media_hash(&mut self, media_id: i64, file_hash: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE media SET file_hash = ?1 WHERE id = ?2",
            params![file_hash, media_id],
        )?;
        Ok(())
    }

    pub fn mark_media_analyzed(&mut self, media_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE media SET analyzed_at = ?1 WHERE id = ?2",
            params![now_i64()?, media_id],
        )?;
        Ok(())
    }

    pub fn insert_location(&mut self, workspace_id: i64, name: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO locations(workspace_id, name, created_at) VALUES (?1, ?2, ?3)",
            params![workspace_id, name, now_i64()?],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn location_workspace(&self, location_id: i64) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT workspace_id FROM locations WHERE id = ?1",
                params![location_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn insert_item(
        &mut self,
        workspace_id: i64,
        owner_user_id: i64,
        title: &str,
        location_id: Option<i64>,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO items(workspace_id, owner_user_id, title, location_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![workspace_id, owner_user_id, title, location_id, now_i64()?],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn item_workspace(&self, item_id: i64) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT workspace_id FROM items WHERE id = ?1",
                params![item_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn link_item_media(&mut self, item_id: i64, media_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO item_media(item_id, media_id) VALUES (?1, ?2)",
            params![item_id, media_id],
        )?;
        Ok(())
    }

    pub fn put_item_embedding(&mut self, item_id: i64, embedding: &[f32]) -> Result<()> {
        let json = serde_json::to_string(embedding)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO item_embeddings(item_id, embedding_json, created_at) VALUES (?1, ?2, ?3)",
            params![item_id, json, now_i64()?],
        )?;
        Ok(())
    }

    /// Items linked to other media in the workspace sharing `file_hash`.
    pub fn items_with_hash(
        &self,
        workspace_id: i64,
        file_hash: &str,
        exclude_media_id: i64,
        location_id: Option<i64>,
    ) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT DISTINCT im.item_id
            FROM media m
            JOIN item_media im ON im.media_id = m.id
            JOIN items i ON i.id = im.item_id
            WHERE m.workspace_id = ?1
              AND m.file_hash = ?2
              AND m.id != ?3
              AND i.workspace_id = ?1
              AND (?4 IS NULL OR i.location_id = ?4)
            ORDER BY im.item_id ASC
            "#,
        )?;
        let rows = stmt.query_map(
            params![workspace_id, file_hash, exclude_media_id, location_id],
            |row| row.get(0),
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    /// Most recent items of the workspace, capped at `limit`.
    pub fn embedding_pool(
        &self,
        workspace_id: i64,
        location_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<PoolEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT i.id, e.embedding_json
            FROM items i
            LEFT JOIN item_embeddings e ON e.item_id = i.id
            WHERE i.workspace_id = ?1
              AND (?2 IS NULL OR i.location_id = ?2)
            ORDER BY COALESCE(e.created_at, i.created_at) DESC, i.id DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(
            params![workspace_id, location_id, limit as i64],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
        )?;
        let mut pool = Vec::new();
        for row in rows {
            let (item_id, json) = row?;
            let embedding = match json {
                Some(json) => Some(serde_json::from_str::<Vec<f32>>(&json)?),
                None => None,
            };
            pool.push(PoolEntry { item_id, embedding });
        }
        Ok(pool)
    }

    /// First photo linked to the item, if any.
    pub fn item_photo(&self, item_id: i64) -> Result<Option<MediaRecord>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM media WHERE id IN (SELECT media_id FROM item_media WHERE item_id = ?1) AND media_type = 'photo' ORDER BY id ASC LIMIT 1",
                    MEDIA_COLUMNS
                ),
                params![item_id],
                read_media_row,
            )
            .optional()?;
        row.map(media_from_row).transpose()
    }
}
