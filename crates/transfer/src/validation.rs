use std::path::{Component, Path, PathBuf};

use crate::TransferError;
use crate::chunked::blocking;

/// Longest object key the store accepts, in UTF-8 bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Validates an object key before any request is made with it.
///
/// Rejects:
/// - Empty keys
/// - Keys longer than [`MAX_KEY_LEN`] bytes
/// - Keys with a leading `/`
/// - Control characters
pub fn validate_object_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(TransferError::InvalidKey("empty key".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(TransferError::InvalidKey(format!(
            "key is {} bytes, limit is {MAX_KEY_LEN}",
            key.len()
        )));
    }
    if key.starts_with('/') {
        return Err(TransferError::InvalidKey(format!(
            "leading slash not allowed: {key}"
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(TransferError::InvalidKey(format!(
            "control characters not allowed: {key:?}"
        )));
    }
    Ok(())
}

/// Validates a download destination and makes sure its directory exists.
///
/// The path must be absolute, must not contain `..`, and must name a file
/// rather than a directory. A missing parent directory is created.
pub fn validate_download_path(path: &Path) -> Result<(), TransferError> {
    if !path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "path must be absolute: {}",
            path.display()
        )));
    }

    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(TransferError::InvalidPath(format!(
            "parent directory traversal not allowed: {}",
            path.display()
        )));
    }

    if path.file_name().is_none() || path.is_dir() {
        return Err(TransferError::InvalidPath(format!(
            "not a file path: {}",
            path.display()
        )));
    }

    if let Some(parent) = path.parent() {
        if parent.exists() {
            if !parent.is_dir() {
                return Err(TransferError::InvalidPath(format!(
                    "parent is not a directory: {}",
                    parent.display()
                )));
            }
        } else {
            std::fs::create_dir_all(parent)?;
        }
    }

    Ok(())
}

/// [`validate_download_path`] on the blocking pool.
pub async fn validate_download_path_async(path: &Path) -> Result<(), TransferError> {
    let path = path.to_path_buf();
    blocking(move || validate_download_path(&path)).await
}

/// [`unique_destination`] on the blocking pool.
pub async fn unique_destination_async(path: &Path) -> Result<PathBuf, TransferError> {
    let path = path.to_path_buf();
    blocking(move || Ok(unique_destination(&path))).await
}

/// Returns `path` if nothing exists there, otherwise the first free
/// `name (N).ext` sibling.
///
/// Falls back to a timestamp suffix after 999 collisions.
pub fn unique_destination(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    let ext = path.extension().map(|s| s.to_string_lossy().into_owned());

    let name = |suffix: &str| match &ext {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };

    for i in 1..1000 {
        let candidate = parent.join(name(&format!(" ({i})")));
        if !candidate.exists() {
            return candidate;
        }
    }

    parent.join(name(&format!("-{}", chrono::Utc::now().timestamp())))
}
