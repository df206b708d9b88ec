//! Free-space checks for download destinations.

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::{debug, warn};

use crate::TransferError;
use crate::chunked::blocking;

/// Outcome of a disk space check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheck {
    /// Enough space is known to be available.
    Sufficient { available: u64 },
    /// Free space could not be determined; the check was let through.
    Unknown,
}

/// Bytes available on the volume holding `path`, if it can be determined.
///
/// Picks the disk with the longest mount point that prefixes `path`.
pub fn available_space(path: &Path) -> Option<u64> {
    let target = nearest_existing(path);
    let target = std::fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Checks that `required` bytes fit on the volume holding `path`.
///
/// Permissive: when free space cannot be measured the check passes with
/// [`SpaceCheck::Unknown`].
pub fn check_disk_space(path: &Path, required: u64) -> Result<SpaceCheck, TransferError> {
    check_with(available_space(path), path, required)
}

/// [`check_disk_space`] on the blocking pool.
pub async fn check_disk_space_async(path: &Path, required: u64) -> Result<SpaceCheck, TransferError> {
    let path = path.to_path_buf();
    blocking(move || check_disk_space(&path, required)).await
}

fn check_with(
    available: Option<u64>,
    path: &Path,
    required: u64,
) -> Result<SpaceCheck, TransferError> {
    match available {
        Some(available) if available < required => {
            Err(TransferError::InsufficientSpace { required, available })
        }
        Some(available) => {
            debug!(path = %path.display(), required, available, "disk space ok");
            Ok(SpaceCheck::Sufficient { available })
        }
        None => {
            warn!(
                path = %path.display(),
                required,
                "could not determine free disk space, continuing"
            );
            Ok(SpaceCheck::Unknown)
        }
    }
}

fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    while !current.exists() {
        match current.parent() {
            Some(parent) if parent != current => current = parent.to_path_buf(),
            _ => break,
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn insufficient_space_is_rejected() {
        let err = check_with(Some(10), Path::new("/data/x"), 11).unwrap_err();
        assert!(matches!(
            err,
            TransferError::InsufficientSpace {
                required: 11,
                available: 10
            }
        ));
    }

    #[test]
    fn exact_fit_passes() {
        let check = check_with(Some(10), Path::new("/data/x"), 10).unwrap();
        assert_eq!(check, SpaceCheck::Sufficient { available: 10 });
    }

    #[test]
    fn unknown_space_is_permissive() {
        let check = check_with(None, Path::new("/data/x"), u64::MAX).unwrap();
        assert_eq!(check, SpaceCheck::Unknown);
    }

    #[test]
    fn nearest_existing_walks_up() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("a/b/c.bin");
        assert_eq!(nearest_existing(&missing), dir.path());
    }

    #[tokio::test]
    async fn async_check_runs_off_the_runtime() {
        let dir = TempDir::new().unwrap();
        let blocking = check_disk_space(&dir.path().join("f"), 1).unwrap();
        let pooled = check_disk_space_async(&dir.path().join("f"), 1).await.unwrap();
        assert_eq!(
            matches!(blocking, SpaceCheck::Unknown),
            matches!(pooled, SpaceCheck::Unknown)
        );
    }

    #[test]
    fn zero_bytes_always_fit() {
        let dir = TempDir::new().unwrap();
        assert!(check_disk_space(&dir.path().join("f"), 0).is_ok());
    }
}
