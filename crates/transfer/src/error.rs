//! Error types and the error classifier.
//!
//! Raw failures come from two places: the object store ([`StoreError`]) and
//! the engine itself ([`TransferError`]). Both are mapped onto a
//! [`ClassifiedError`] through the [`Classify`] trait, which is the only place
//! that decides whether a failure is worth retrying.

use std::fmt;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failures reported by an [`ObjectStore`](crate::ObjectStore) implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("request timed out")]
    Timeout,

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("bucket not found: {0}")]
    NoSuchBucket(String),

    #[error("object not found: {0}")]
    NoSuchKey(String),

    #[error("multipart upload not found: {0}")]
    NoSuchUpload(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("local I/O error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Errors produced by the transfer engines.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("paused")]
    Paused,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("insufficient disk space: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("part {0} has no integrity token")]
    MissingEtag(u32),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: crate::TransferStatus,
        to: crate::TransferStatus,
    },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task is still running: {0}")]
    TaskRunning(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransferError {
    /// Returns `true` for the two cooperative-stop outcomes.
    pub fn is_interruption(&self) -> bool {
        matches!(self, TransferError::Cancelled | TransferError::Paused)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Broad origin of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    Network,
    StorageService,
    Filesystem,
    Validation,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::StorageService => "storage-service",
            ErrorCategory::Filesystem => "filesystem",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// How serious a failure is for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A failure after classification.
///
/// `retryable` is derived from the category and code when the error is built
/// and cannot be changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    category: ErrorCategory,
    severity: Severity,
    retryable: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    timestamp: DateTime<Utc>,
}

impl ClassifiedError {
    fn new(category: ErrorCategory, severity: Severity, retryable: bool, message: String) -> Self {
        Self {
            category,
            severity,
            retryable,
            message,
            status: None,
            timestamp: Utc::now(),
        }
    }

    fn network(severity: Severity, message: String) -> Self {
        Self::new(ErrorCategory::Network, severity, true, message)
    }

    fn storage(severity: Severity, message: String) -> Self {
        Self::new(ErrorCategory::StorageService, severity, false, message)
    }

    fn filesystem(severity: Severity, message: String) -> Self {
        Self::new(ErrorCategory::Filesystem, severity, false, message)
    }

    fn validation(severity: Severity, message: String) -> Self {
        Self::new(ErrorCategory::Validation, severity, false, message)
    }

    fn unknown(status: Option<u16>, message: String) -> Self {
        let severity = match status {
            Some(code) if code >= 500 => Severity::High,
            _ => Severity::Medium,
        };
        let mut err = Self::new(ErrorCategory::Unknown, severity, false, message);
        err.status = status;
        err
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status code, when the failure came with one.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns `true` if the task must be failed at once, whatever its budget.
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// Short hints the UI can show next to the error.
    pub fn suggestions(&self) -> &'static [&'static str] {
        match (self.category, self.severity) {
            (ErrorCategory::Network, _) => &[
                "check your network connection",
                "verify the endpoint URL",
                "retry the transfer",
            ],
            (ErrorCategory::StorageService, Severity::Critical) => {
                &["check credentials", "re-enter the access key and secret"]
            }
            (ErrorCategory::StorageService, _) => &[
                "check bucket permissions",
                "verify the bucket and object key exist",
            ],
            (ErrorCategory::Filesystem, Severity::Critical) => {
                &["free disk space", "choose another destination"]
            }
            (ErrorCategory::Filesystem, _) => &[
                "check file permissions",
                "verify the local path exists",
            ],
            (ErrorCategory::Validation, _) => &["check the transfer settings and paths"],
            (ErrorCategory::Unknown, _) => &["retry later", "check the application logs"],
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

/// Maps a raw failure onto the error taxonomy.
pub trait Classify {
    fn classify(&self) -> ClassifiedError;
}

/// Convenience wrapper over [`Classify::classify`].
pub fn classify<E: Classify + ?Sized>(err: &E) -> ClassifiedError {
    err.classify()
}

impl Classify for StoreError {
    fn classify(&self) -> ClassifiedError {
        let msg = self.to_string();
        match self {
            StoreError::Timeout => ClassifiedError::network(Severity::Medium, msg),
            StoreError::ConnectionRefused(_) | StoreError::Dns(_) => {
                ClassifiedError::network(Severity::High, msg)
            }
            StoreError::ConnectionReset(_) => ClassifiedError::network(Severity::Medium, msg),
            StoreError::AccessDenied(_) => ClassifiedError::storage(Severity::High, msg),
            StoreError::InvalidCredentials(_) => ClassifiedError::storage(Severity::Critical, msg),
            StoreError::NoSuchBucket(_) | StoreError::NoSuchKey(_) | StoreError::NoSuchUpload(_) => {
                ClassifiedError::storage(Severity::High, msg)
            }
            StoreError::Http { status: 401, .. } => {
                ClassifiedError::storage(Severity::Critical, msg).with_status(401)
            }
            StoreError::Http { status: 403, .. } => {
                ClassifiedError::storage(Severity::High, msg).with_status(403)
            }
            StoreError::Http { status: 404, .. } => {
                ClassifiedError::storage(Severity::High, msg).with_status(404)
            }
            StoreError::Http { status, .. } => ClassifiedError::unknown(Some(*status), msg),
            StoreError::Io { kind, .. } => classify_io_kind(*kind, msg),
            StoreError::Other(_) => ClassifiedError::unknown(None, msg),
        }
    }
}

impl Classify for io::Error {
    fn classify(&self) -> ClassifiedError {
        classify_io_kind(self.kind(), self.to_string())
    }
}

fn classify_io_kind(kind: io::ErrorKind, msg: String) -> ClassifiedError {
    use io::ErrorKind;
    match kind {
        ErrorKind::StorageFull => ClassifiedError::filesystem(Severity::Critical, msg),
        ErrorKind::PermissionDenied => ClassifiedError::filesystem(Severity::High, msg),
        ErrorKind::NotFound => ClassifiedError::filesystem(Severity::Medium, msg),
        ErrorKind::TimedOut => ClassifiedError::network(Severity::Medium, msg),
        ErrorKind::ConnectionRefused => ClassifiedError::network(Severity::High, msg),
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => ClassifiedError::network(Severity::Medium, msg),
        _ => ClassifiedError::unknown(None, msg),
    }
}

impl Classify for TransferError {
    fn classify(&self) -> ClassifiedError {
        let msg = self.to_string();
        match self {
            TransferError::Store(e) => e.classify(),
            TransferError::Io(e) => e.classify(),
            TransferError::InsufficientSpace { .. } => {
                ClassifiedError::filesystem(Severity::Critical, msg)
            }
            TransferError::ChecksumMismatch { .. }
            | TransferError::SizeMismatch { .. }
            | TransferError::MissingEtag(_) => ClassifiedError::validation(Severity::High, msg),
            TransferError::InvalidPath(_)
            | TransferError::InvalidKey(_)
            | TransferError::InvalidTransition { .. }
            | TransferError::TaskNotFound(_)
            | TransferError::TaskRunning(_)
            | TransferError::InvalidConfig(_) => {
                ClassifiedError::validation(Severity::Medium, msg)
            }
            TransferError::Cancelled | TransferError::Paused => {
                ClassifiedError::new(ErrorCategory::Validation, Severity::Low, false, msg)
            }
        }
    }
}
