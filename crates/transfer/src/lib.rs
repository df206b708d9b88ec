//! Resumable, retrying transfer engine for S3-compatible object stores.
//!
//! Uploads go through a single PUT or a multipart upload depending on size;
//! downloads stream ranged GETs into the destination file and pick up where
//! they left off. Failures are classified into a small taxonomy that decides
//! what is retried, and every task reports its lifecycle and progress as
//! [`TransferEvent`]s.
//!
//! The store itself is abstracted behind [`ObjectStore`]; [`MemoryStore`] is
//! an in-process implementation used by the tests.

mod chunked;
mod config;
mod control;
mod disk;
mod download;
mod error;
mod limiter;
mod manager;
pub mod memory;
mod planner;
mod progress;
mod retry;
mod store;
mod types;
mod upload;
mod validation;

pub use chunked::{AppendWriter, checksum_bytes, file_checksum, file_checksum_async, read_range};
pub use config::{EngineConfig, SharedConfig};
pub use control::TaskControl;
pub use disk::{SpaceCheck, available_space, check_disk_space, check_disk_space_async};
pub use download::{DownloadEngine, DownloadOptions};
pub use error::{
    ClassifiedError, Classify, ErrorCategory, Severity, StoreError, TransferError, classify,
};
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use manager::TransferManager;
pub use memory::MemoryStore;
pub use planner::{MAX_PARTS, effective_part_size, plan, should_use_multipart};
pub use progress::{EVENT_CHANNEL_CAPACITY, EventSink, ProgressReporter, SpeedWindow, TransferEvent};
pub use retry::{Retry, RetryBudget, RetryPolicy, with_retry};
pub use store::{ByteStream, CompletedPart, ObjectMetadata, ObjectStore, StoreFuture, UploadedPart};
pub use types::{Direction, PartDescriptor, PartStatus, TaskId, TransferStatus, TransferTask};
pub use upload::UploadEngine;
pub use validation::{
    MAX_KEY_LEN, unique_destination, unique_destination_async, validate_download_path,
    validate_download_path_async, validate_object_key,
};

use std::time::Duration;

/// Default multipart part size: 10 MiB.
pub const DEFAULT_PART_SIZE: u64 = 10 * 1024 * 1024;

/// Files strictly larger than this are uploaded in parts: 100 MiB.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;

pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 3;

/// Per-request timeout applied to every store call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries a single task may spend before it is failed.
pub const DEFAULT_MAX_TASK_RETRIES: u32 = 3;
