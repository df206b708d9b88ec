//! Object-store capability consumed by the engines.
//!
//! The desktop client implements [`ObjectStore`] on top of its S3 client.
//! Keeping it a trait lets the engines run against [`MemoryStore`] in tests.
//!
//! [`MemoryStore`]: crate::memory::MemoryStore

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::Stream;

use crate::error::{StoreError, TransferError};

/// Boxed future returned by every store operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Body of a ranged GET, delivered in chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, StoreError>> + Send>>;

/// Result of `HEAD` on an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
    /// Hex SHA-256 of the whole object, when the store publishes one.
    pub checksum_sha256: Option<String>,
}

/// A part the store already holds for an in-flight multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// `(partNumber, etag)` pair presented to the completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Object-storage operations the engines rely on.
pub trait ObjectStore: Send + Sync {
    fn head_object<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMetadata>;

    /// Uploads a whole object in one request. Returns its etag.
    fn put_object<'a>(&'a self, key: &'a str, body: Vec<u8>) -> StoreFuture<'a, String>;

    /// Starts a multipart upload. Returns the upload id.
    fn create_multipart_upload<'a>(&'a self, key: &'a str) -> StoreFuture<'a, String>;

    /// Uploads one part. Returns the part's etag.
    fn upload_part<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        part_number: u32,
        body: Vec<u8>,
    ) -> StoreFuture<'a, String>;

    fn list_parts<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
    ) -> StoreFuture<'a, Vec<UploadedPart>>;

    /// Assembles the object from `parts`, which must be in ascending
    /// part-number order. Returns the object's etag.
    fn complete_multipart_upload<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        parts: Vec<CompletedPart>,
    ) -> StoreFuture<'a, String>;

    fn abort_multipart_upload<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// Streams the object from `start` to its end.
    fn get_object_range<'a>(&'a self, key: &'a str, start: u64) -> StoreFuture<'a, ByteStream>;
}

/// Awaits a store call, turning expiry of `limit` into [`StoreError::Timeout`].
pub(crate) async fn timed<T>(limit: Duration, call: StoreFuture<'_, T>) -> Result<T, TransferError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Timeout.into()),
    }
}
