//! Inventory Vision
//!
//! Turns a photo or video of a physical item into reviewable detections:
//! candidate regions, per-region embeddings and ranked links to existing
//! inventory items.
//!
//! # Module Structure
//!
//! - `detect`: object detector service (model-backed or heuristic fallback)
//! - `embed`: region embedding service
//! - `matcher`: cosine scoring, exact-hash signal, top-K merge and hints
//! - `video`: frame sources, sampling cadence and temp frames
//! - `store`: SQLite persistence of detections, catalog and upload history
//! - `pipeline`: the orchestrator tying the above together
//! - `cli` / `ui`: the `visiond` command line

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod cli;
pub mod config;
pub mod detect;
pub mod embed;
pub mod error;
pub mod matcher;
pub mod media;
pub mod model;
pub mod pipeline;
pub mod store;
pub mod ui;
pub mod video;

pub use config::PipelineConfig;
pub use detect::DetectorService;
pub use embed::EmbeddingService;
pub use error::{AnalysisError, AnalysisResult};
pub use media::{FilesystemMediaStore, MediaStore};
pub use model::{
    Decision, Detection, DetectionCandidate, DetectionObject, DetectionStatus, ReviewAction,
    ReviewLogEntry, UploadHistoryEntry, UploadStatus,
};
pub use pipeline::{Pipeline, VideoOptions};
pub use store::Store;

/// URI of a fresh shared-cache in-memory database.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:inventory_vision_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_memory_uris_are_unique() {
        let a = shared_memory_uri();
        let b = shared_memory_uri();
        assert!(a.starts_with("file:inventory_vision_"));
        assert_ne!(a, b);
    }

    #[test]
    fn shared_memory_connections_see_each_other() {
        let uri = shared_memory_uri();
        let first = open_db_connection(&uri).unwrap();
        first
            .execute_batch("CREATE TABLE t(x INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();
        let second = open_db_connection(&uri).unwrap();
        let x: i64 = second.query_row("SELECT x FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(x, 7);
    }
}
