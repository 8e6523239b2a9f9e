use std::path::Path;

use anyhow::{Context, Result};

pub mod blob;

#[cfg(feature = "backend-tract")]
pub mod tract;

#[cfg(feature = "backend-tract")]
pub use tract::TractYoloBackend;

/// Read newline-separated class names. Blank lines and `#` comments are skipped.
pub fn load_labels(path: Option<&Path>) -> Result<Vec<String>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read label file {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
