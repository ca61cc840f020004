// Helpers shared by scanners of revision directories, queues and external sources
use std::path::{Component, Path};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DatasetError, Result};

/// Files created by desktop operating systems that never belong in a dataset
pub fn is_os_artifact(name: &str) -> bool {
    matches!(name, ".DS_Store" | "Thumbs.db" | "desktop.ini") || name.starts_with("._")
}

/// Convert a path relative to a scan root into a manifest key
///
/// Keys always use `/` separators; directory keys get a trailing `/`.
pub fn to_key(relative: &Path, is_dir: bool) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    DatasetError::InvalidArgument(format!("Path is not valid UTF-8: {}", relative.display()))
                })?;
                parts.push(part);
            }
            Component::CurDir => {}
            _ => {
                return Err(DatasetError::InvalidArgument(format!(
                    "Path must be relative and stay inside the dataset: {}",
                    relative.display()
                )))
            }
        }
    }

    let mut key = parts.join("/");
    if is_dir && !key.is_empty() {
        key.push('/');
    }
    Ok(key)
}

/// Validate a user supplied key and normalise it
pub fn normalize_key(key: &str) -> Result<String> {
    let is_dir = key.ends_with('/');
    let normalized = to_key(Path::new(key.trim_end_matches('/')), is_dir)?;
    if normalized.is_empty() {
        return Err(DatasetError::InvalidArgument("Empty dataset path".to_string()));
    }
    Ok(normalized)
}

/// Modification time as fractional seconds since the epoch
pub fn mtime_secs(modified: SystemTime) -> Option<f64> {
    modified.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs_f64())
}
