//! Storage collaborator: resolves stored media descriptors to bytes.
//!
//! Descriptors are relative paths. A `private/` prefix selects the private
//! root, anything else the public root. Absolute paths and `stub://` sources
//! are passed through untouched.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::MediaSettings;

const PRIVATE_PREFIX: &str = "private/";

pub trait MediaStore: Send {
    /// Map a descriptor to a location on local storage.
    fn resolve(&self, descriptor: &str) -> PathBuf;

    fn exists(&self, descriptor: &str) -> bool {
        let path = self.resolve(descriptor);
        is_synthetic(descriptor) || path.exists()
    }

    fn read_bytes(&self, descriptor: &str) -> Result<Vec<u8>> {
        let path = self.resolve(descriptor);
        std::fs::read(&path).with_context(|| format!("read media file {}", path.display()))
    }

    /// Scratch directory for sampled video frames.
    fn frame_dir(&self) -> PathBuf;
}

pub struct FilesystemMediaStore {
    public_root: PathBuf,
    private_root: PathBuf,
    frame_dir: PathBuf,
}

impl FilesystemMediaStore {
    pub fn new(settings: &MediaSettings) -> Self {
        Self {
            public_root: settings.public_root.clone(),
            private_root: settings.private_root.clone(),
            frame_dir: settings.frame_dir(),
        }
    }
}

impl MediaStore for FilesystemMediaStore {
    fn resolve(&self, descriptor: &str) -> PathBuf {
        if is_synthetic(descriptor) {
            return PathBuf::from(descriptor);
        }
        if let Some(rel) = descriptor.strip_prefix(PRIVATE_PREFIX) {
            return join_unless_absolute(&self.private_root, rel);
        }
        join_unless_absolute(&self.public_root, descriptor)
    }

    fn frame_dir(&self) -> PathBuf {
        self.frame_dir.clone()
    }
}

fn join_unless_absolute(root: &Path, rel: &str) -> PathBuf {
    let rel = Path::new(rel);
    if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        root.join(rel)
    }
}

pub fn is_synthetic(descriptor: &str) -> bool {
    descriptor.starts_with("stub://")
}

/// SHA-256 of the stored bytes, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FilesystemMediaStore {
        FilesystemMediaStore::new(&MediaSettings {
            public_root: PathBuf::from("/srv/public"),
            private_root: PathBuf::from("/srv/private"),
            tmp_dir: None,
        })
    }

    #[test]
    fn private_prefix_selects_private_root() {
        let store = store();
        assert_eq!(
            store.resolve("private/uploads/20251207/photo.jpg"),
            PathBuf::from("/srv/private/uploads/20251207/photo.jpg")
        );
        assert_eq!(
            store.resolve("uploads/photo.jpg"),
            PathBuf::from("/srv/public/uploads/photo.jpg")
        );
        assert_eq!(store.resolve("/abs/photo.jpg"), PathBuf::from("/abs/photo.jpg"));
        assert_eq!(store.frame_dir(), PathBuf::from("/srv/public/tmp_frames"));
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
