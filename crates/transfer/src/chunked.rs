use std::io::{Read, SeekFrom};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::TransferError;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// [`file_checksum`] on the blocking pool.
pub async fn file_checksum_async(path: &Path) -> Result<String, TransferError> {
    let path = path.to_path_buf();
    blocking(move || file_checksum(&path)).await
}

/// Runs filesystem work that may block on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, TransferError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TransferError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(format!("task join error: {e}"))))?
}

// ---------------------------------------------------------------------------
// Part reads
// ---------------------------------------------------------------------------

/// Reads exactly `len` bytes at `offset` from `path`.
///
/// Fails with `UnexpectedEof` if the file has shrunk since it was planned.
pub async fn read_range(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// AppendWriter
// ---------------------------------------------------------------------------

/// Sequential writer for a download destination.
///
/// Bytes are only ever appended, and every chunk is flushed before the
/// offset advances, so `offset()` is always the last byte known to be on
/// disk.
pub struct AppendWriter {
    path: PathBuf,
    file: tokio::fs::File,
    offset: u64,
}

impl AppendWriter {
    /// Opens `path` for appending, creating parent directories and the file
    /// as needed. With `truncate`, any existing content is discarded first.
    pub async fn open(path: &Path, truncate: bool) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        if truncate {
            tokio::fs::File::create(path).await?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let offset = file.metadata().await?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            offset,
        })
    }

    /// Appends `data` and flushes it.
    pub async fn append(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.file.write_all(data).await?;
        self.file.flush().await?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Bytes on disk.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes file contents to stable storage.
    pub async fn sync(&mut self) -> Result<(), TransferError> {
        self.file.sync_all().await?;
        Ok(())
    }
}
