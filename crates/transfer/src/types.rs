use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ClassifiedError, TransferError};

/// Opaque task identifier (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

/// Lifecycle of a [`TransferTask`].
///
/// `pending → active → {completed | failed | paused | cancelled}` and
/// `paused → active`. Completed, failed and cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    fn can_become(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Pending, Active) => true,
            (Active, Completed | Failed | Paused | Cancelled) => true,
            (Paused, Active | Cancelled) => true,
            // Pre-flight failures and cancellations before the first byte.
            (Pending, Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Active => "active",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One object transfer.
///
/// While a transfer runs, the task is owned by the engine processing it and
/// nothing else mutates it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: TaskId,
    pub object_key: String,
    pub local_path: PathBuf,
    pub direction: Direction,
    status: TransferStatus,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Multipart upload id, kept so a paused upload can be resumed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    /// Part size the multipart upload was planned with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_size_bytes: Option<u64>,
    /// Etag of the remote object a download started from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferTask {
    /// Creates a pending task with a fresh id.
    pub fn new(direction: Direction, object_key: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            object_key: object_key.into(),
            local_path: local_path.into(),
            direction,
            status: TransferStatus::Pending,
            total_bytes: 0,
            transferred_bytes: 0,
            retry_count: 0,
            max_retries: crate::DEFAULT_MAX_TASK_RETRIES,
            upload_id: None,
            part_size_bytes: None,
            remote_etag: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn upload(object_key: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self::new(Direction::Upload, object_key, local_path)
    }

    pub fn download(object_key: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self::new(Direction::Download, object_key, local_path)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Moves the task to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, next: TransferStatus) -> Result<(), TransferError> {
        if !self.status.can_become(next) {
            return Err(TransferError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Marks the task failed and records why.
    pub fn fail(&mut self, error: ClassifiedError) -> Result<(), TransferError> {
        self.transition(TransferStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Adds progress. Never moves the counter backwards.
    pub fn add_progress(&mut self, bytes: u64) {
        self.transferred_bytes = self.transferred_bytes.saturating_add(bytes);
        self.updated_at = Utc::now();
    }

    /// Restarts the byte counter, for transfers that begin again from zero.
    pub fn reset_progress(&mut self) {
        self.transferred_bytes = 0;
        self.updated_at = Utc::now();
    }

    /// Progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0
    }
}

/// Upload state of a single part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartStatus {
    Pending,
    Uploading,
    Done,
    Failed,
}

/// One chunk of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartDescriptor {
    /// 1-based, contiguous.
    pub part_number: u32,
    /// Byte offset of the part within the object.
    pub offset: u64,
    pub size_bytes: u64,
    pub status: PartStatus,
    pub etag: Option<String>,
}

impl PartDescriptor {
    pub fn is_done(&self) -> bool {
        self.status == PartStatus::Done && self.etag.as_deref().is_some_and(|e| !e.is_empty())
    }

    pub fn mark_done(&mut self, etag: String) {
        self.etag = Some(etag);
        self.status = PartStatus::Done;
    }
}
