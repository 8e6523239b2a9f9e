//! SQLite persistence for detections, review log, upload history and the
//! read-mostly inventory catalog the matcher draws on.

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;

use crate::{now_s, open_db_connection, shared_memory_uri};

mod catalog;
mod detections;
mod uploads;

pub use catalog::{NewMedia, PoolEntry};
pub use detections::NewObject;
pub use uploads::NewUpload;

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (and migrate) the database at `db_path`.
    ///
    /// `":memory:"` maps to a fresh shared-cache in-memory database so that a
    /// second connection opened with the same URI sees the same data.
    pub fn open(db_path: &str) -> Result<Self> {
        let db_path = if db_path == ":memory:" {
            shared_memory_uri()
        } else {
            db_path.to_string()
        };
        let conn = open_db_connection(&db_path)
            .with_context(|| format!("open database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS locations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              workspace_id INTEGER NOT NULL,
              name TEXT NOT NULL,
              parent_id INTEGER REFERENCES locations(id),
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS items (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              workspace_id INTEGER NOT NULL,
              owner_user_id INTEGER NOT NULL,
              title TEXT NOT NULL,
              location_id INTEGER REFERENCES locations(id),
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS media (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              workspace_id INTEGER NOT NULL,
              owner_user_id INTEGER NOT NULL,
              location_id INTEGER REFERENCES locations(id),
              media_type TEXT NOT NULL,
              path TEXT NOT NULL,
              mime_type TEXT,
              file_hash TEXT,
              created_at INTEGER NOT NULL,
              analyzed_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS item_media (
              item_id INTEGER NOT NULL REFERENCES items(id),
              media_id INTEGER NOT NULL REFERENCES media(id),
              PRIMARY KEY (item_id, media_id)
            );

            CREATE TABLE IF NOT EXISTS item_embeddings (
              item_id INTEGER PRIMARY KEY REFERENCES items(id),
              embedding_json TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              media_id INTEGER NOT NULL REFERENCES media(id),
              status TEXT NOT NULL,
              raw_json TEXT NOT NULL DEFAULT '{}',
              created_at INTEGER NOT NULL,
              completed_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS detection_objects (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              detection_id INTEGER NOT NULL REFERENCES detections(id),
              label TEXT NOT NULL,
              confidence REAL NOT NULL,
              bbox_json TEXT NOT NULL,
              suggested_location_id INTEGER,
              decision TEXT NOT NULL DEFAULT 'pending',
              item_id INTEGER,
              location_id INTEGER,
              decided_by INTEGER,
              decided_at INTEGER,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detection_candidates (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              detection_object_id INTEGER NOT NULL REFERENCES detection_objects(id),
              item_id INTEGER NOT NULL,
              score REAL NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS review_log (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              detection_id INTEGER NOT NULL REFERENCES detections(id),
              actor_id INTEGER,
              action TEXT NOT NULL,
              payload_json TEXT NOT NULL DEFAULT '{}',
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS upload_history (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              media_id INTEGER REFERENCES media(id),
              detection_id INTEGER REFERENCES detections(id),
              workspace_id INTEGER NOT NULL,
              owner_user_id INTEGER NOT NULL,
              location_id INTEGER,
              media_type TEXT NOT NULL,
              status TEXT NOT NULL,
              source TEXT,
              ai_status TEXT,
              ai_summary_json TEXT,
              path TEXT,
              thumb_path TEXT,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_media_hash ON media(workspace_id, file_hash);
            CREATE INDEX IF NOT EXISTS idx_items_workspace ON items(workspace_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_detections_media ON detections(media_id);
            CREATE INDEX IF NOT EXISTS idx_detections_status ON detections(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_objects_detection ON detection_objects(detection_id);
            CREATE INDEX IF NOT EXISTS idx_candidates_object ON detection_candidates(detection_object_id);
            CREATE INDEX IF NOT EXISTS idx_review_detection ON review_log(detection_id);
            CREATE INDEX IF NOT EXISTS idx_uploads_media ON upload_history(media_id, created_at);
            "#,
        )?;
        Ok(())
    }
}

fn now_i64() -> Result<i64> {
    Ok(now_s()? as i64)
}

fn parse_column<T>(value: &str, column: &str) -> Result<T>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    value
        .parse()
        .map_err(|e| anyhow!("corrupt {} value '{}': {}", column, value, e))
}
