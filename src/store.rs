use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::Builder;

use crate::error::AlmaError;

/// UTC timestamp in `2026-02-15T00:00:00Z` form.
pub fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Writes through a sibling temp file, fsyncs it, then renames over `path`.
/// A crash at any point leaves either the old or the new document.
pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), AlmaError> {
    let parent = match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
        Some(parent) => parent,
        None => {
            return Err(AlmaError::Filesystem(format!(
                "no parent for {}",
                path.display()
            )));
        }
    };
    fs::create_dir_all(parent).map_err(|err| AlmaError::Filesystem(err.to_string()))?;

    let mut temp = Builder::new()
        .prefix(".alma-bulk")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|err| AlmaError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| AlmaError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| AlmaError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| AlmaError::Filesystem(err.to_string()))?;

    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), AlmaError> {
    let mut content =
        serde_json::to_vec_pretty(value).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
    content.push(b'\n');
    write_bytes_atomic(path, &content)
}

/// Reads a JSON document. A missing file is `None`; a file that exists but
/// does not parse is reported, never replaced.
pub fn read_json_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, AlmaError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|err| AlmaError::DocumentCorruption {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let value = serde_json::from_str(&content).map_err(|err| AlmaError::DocumentCorruption {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(Some(value))
}

/// Every path below `root`, sorted.
pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, AlmaError> {
    let mut items = Vec::new();
    if !root.exists() {
        return Ok(items);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| AlmaError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| AlmaError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}

pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, AlmaError> {
    Ok(walk_dir(root)?
        .into_iter()
        .filter(|path| path.is_file())
        .collect())
}
