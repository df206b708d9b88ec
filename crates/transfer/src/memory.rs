//! In-memory [`ObjectStore`] with fault injection and call recording.
//!
//! Deterministic stand-in for a real bucket: objects live in a map, multipart
//! uploads are assembled on completion, and failures can be scripted per
//! operation or in the middle of a download stream.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;

use crate::chunked::checksum_bytes;
use crate::error::StoreError;
use crate::store::{
    ByteStream, CompletedPart, ObjectMetadata, ObjectStore, StoreFuture, UploadedPart,
};

/// Default size of the chunks yielded by `get_object_range`.
pub const DEFAULT_STREAM_CHUNK: usize = 64 * 1024;

/// Store operation, used to target injected faults and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Head,
    Put,
    CreateMultipart,
    UploadPart,
    ListParts,
    Complete,
    Abort,
    GetRange,
}

/// A recorded store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Head { key: String },
    Put { key: String, size: u64 },
    CreateMultipart { key: String },
    UploadPart { key: String, upload_id: String, part_number: u32, size: u64 },
    ListParts { key: String, upload_id: String },
    Complete { key: String, upload_id: String, parts: Vec<CompletedPart> },
    Abort { key: String, upload_id: String },
    GetRange { key: String, start: u64 },
}

impl StoreCall {
    pub fn op(&self) -> StoreOp {
        match self {
            StoreCall::Head { .. } => StoreOp::Head,
            StoreCall::Put { .. } => StoreOp::Put,
            StoreCall::CreateMultipart { .. } => StoreOp::CreateMultipart,
            StoreCall::UploadPart { .. } => StoreOp::UploadPart,
            StoreCall::ListParts { .. } => StoreOp::ListParts,
            StoreCall::Complete { .. } => StoreOp::Complete,
            StoreCall::Abort { .. } => StoreOp::Abort,
            StoreCall::GetRange { .. } => StoreOp::GetRange,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    checksum: Option<String>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Debug)]
struct StreamFault {
    after_bytes: u64,
    error: StoreError,
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    faults: HashMap<StoreOp, VecDeque<StoreError>>,
    stream_faults: VecDeque<StreamFault>,
    calls: Vec<StoreCall>,
}

/// In-memory bucket.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    stream_chunk: usize,
    latency: Option<Duration>,
    chunk_delay: Option<Duration>,
    publish_checksums: bool,
    parts_in_flight: AtomicUsize,
    peak_parts_in_flight: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            stream_chunk: DEFAULT_STREAM_CHUNK,
            latency: None,
            chunk_delay: None,
            publish_checksums: true,
            parts_in_flight: AtomicUsize::new(0),
            peak_parts_in_flight: AtomicUsize::new(0),
        }
    }

    /// Size of the chunks a download stream yields.
    pub fn with_stream_chunk(mut self, bytes: usize) -> Self {
        self.stream_chunk = bytes.max(1);
        self
    }

    /// Delay applied at the start of every operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Delay before each chunk of a download stream.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Whether `head_object` reports a content checksum.
    pub fn with_checksums(mut self, publish: bool) -> Self {
        self.publish_checksums = publish;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_object(&self, key: &str, data: Vec<u8>) {
        let etag = simple_etag(&data);
        let checksum = Some(checksum_bytes(&data));
        self.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data,
                etag,
                checksum,
            },
        );
    }

    /// Overrides the checksum reported for `key`.
    pub fn set_checksum(&self, key: &str, checksum: &str) {
        if let Some(obj) = self.lock().objects.get_mut(key) {
            obj.checksum = Some(checksum.to_string());
        }
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).map(|o| o.data.clone())
    }

    /// Makes the next call to `op` fail with `error`. Faults queue up.
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.lock().faults.entry(op).or_default().push_back(error);
    }

    /// Makes the next `times` calls to `op` fail with `error`.
    pub fn fail_times(&self, op: StoreOp, times: usize, error: StoreError) {
        let mut state = self.lock();
        let queue = state.faults.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Makes the next download stream fail after yielding `after_bytes`.
    pub fn fail_stream_after(&self, after_bytes: u64, error: StoreError) {
        self.lock().stream_faults.push_back(StreamFault { after_bytes, error });
    }

    /// Starts a multipart upload holding the given parts, as a previous
    /// session would have left it. Returns the upload id.
    pub fn seed_upload(&self, key: &str, parts: &[(u32, Vec<u8>)]) -> String {
        let mut state = self.lock();
        let upload_id = next_upload_id(&mut state);
        let parts = parts
            .iter()
            .map(|(n, data)| (*n, (simple_etag(data), data.clone())))
            .collect();
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts,
            },
        );
        upload_id
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: StoreOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    /// Part numbers sent through `upload_part`, in call order.
    pub fn uploaded_part_numbers(&self) -> Vec<u32> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                StoreCall::UploadPart { part_number, .. } => Some(*part_number),
                _ => None,
            })
            .collect()
    }

    /// Start offsets of every ranged GET, in call order.
    pub fn range_starts(&self) -> Vec<u64> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                StoreCall::GetRange { start, .. } => Some(*start),
                _ => None,
            })
            .collect()
    }

    /// Multipart uploads neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Highest number of `upload_part` calls observed running at once.
    pub fn peak_parts_in_flight(&self) -> usize {
        self.peak_parts_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: StoreCall) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        let op = call.op();
        state.calls.push(call);
        match state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn next_upload_id(state: &mut MemoryState) -> String {
    state.next_upload += 1;
    format!("upload-{}", state.next_upload)
}

fn simple_etag(data: &[u8]) -> String {
    format!("\"{}\"", &checksum_bytes(data)[..32])
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ObjectStore for MemoryStore {
    fn head_object<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMetadata> {
        Box::pin(async move {
            self.enter(StoreCall::Head { key: key.into() }).await?;
            let state = self.lock();
            let obj = state
                .objects
                .get(key)
                .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))?;
            Ok(ObjectMetadata {
                size: obj.data.len() as u64,
                etag: obj.etag.clone(),
                last_modified: Some(Utc::now()),
                checksum_sha256: if self.publish_checksums {
                    obj.checksum.clone()
                } else {
                    None
                },
            })
        })
    }

    fn put_object<'a>(&'a self, key: &'a str, body: Vec<u8>) -> StoreFuture<'a, String> {
        Box::pin(async move {
            self.enter(StoreCall::Put {
                key: key.into(),
                size: body.len() as u64,
            })
            .await?;
            let etag = simple_etag(&body);
            self.insert_object(key, body);
            Ok(etag)
        })
    }

    fn create_multipart_upload<'a>(&'a self, key: &'a str) -> StoreFuture<'a, String> {
        Box::pin(async move {
            self.enter(StoreCall::CreateMultipart { key: key.into() })
                .await?;
            let mut state = self.lock();
            let upload_id = next_upload_id(&mut state);
            state.uploads.insert(
                upload_id.clone(),
                PendingUpload {
                    key: key.to_string(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
        })
    }

    fn upload_part<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        part_number: u32,
        body: Vec<u8>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let now = self.parts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = InFlightGuard(&self.parts_in_flight);
            self.peak_parts_in_flight.fetch_max(now, Ordering::SeqCst);

            self.enter(StoreCall::UploadPart {
                key: key.into(),
                upload_id: upload_id.into(),
                part_number,
                size: body.len() as u64,
            })
            .await?;

            let mut state = self.lock();
            let upload = state
                .uploads
                .get_mut(upload_id)
                .filter(|u| u.key == key)
                .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;
            let etag = simple_etag(&body);
            upload.parts.insert(part_number, (etag.clone(), body));
            Ok(etag)
        })
    }

    fn list_parts<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
    ) -> StoreFuture<'a, Vec<UploadedPart>> {
        Box::pin(async move {
            self.enter(StoreCall::ListParts {
                key: key.into(),
                upload_id: upload_id.into(),
            })
            .await?;
            let state = self.lock();
            let upload = state
                .uploads
                .get(upload_id)
                .filter(|u| u.key == key)
                .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;
            Ok(upload
                .parts
                .iter()
                .map(|(n, (etag, data))| UploadedPart {
                    part_number: *n,
                    etag: etag.clone(),
                    size: data.len() as u64,
                })
                .collect())
        })
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
        parts: Vec<CompletedPart>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            self.enter(StoreCall::Complete {
                key: key.into(),
                upload_id: upload_id.into(),
                parts: parts.clone(),
            })
            .await?;

            let mut state = self.lock();
            let upload = state
                .uploads
                .get(upload_id)
                .filter(|u| u.key == key)
                .ok_or_else(|| StoreError::NoSuchUpload(upload_id.to_string()))?;

            if parts.is_empty() || parts.windows(2).any(|w| w[0].part_number >= w[1].part_number)
            {
                return Err(StoreError::Http {
                    status: 400,
                    message: "InvalidPartOrder".into(),
                });
            }

            let mut data = Vec::new();
            for part in &parts {
                match upload.parts.get(&part.part_number) {
                    Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
                    _ => {
                        return Err(StoreError::Http {
                            status: 400,
                            message: format!("InvalidPart {}", part.part_number),
                        });
                    }
                }
            }

            state.uploads.remove(upload_id);
            let etag = format!(
                "\"{}-{}\"",
                &checksum_bytes(&data)[..32],
                parts.len()
            );
            let checksum = Some(checksum_bytes(&data));
            state.objects.insert(
                key.to_string(),
                StoredObject {
                    data,
                    etag: etag.clone(),
                    checksum,
                },
            );
            Ok(etag)
        })
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        key: &'a str,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.enter(StoreCall::Abort {
                key: key.into(),
                upload_id: upload_id.into(),
            })
            .await?;
            let mut state = self.lock();
            match state.uploads.get(upload_id) {
                Some(u) if u.key == key => {
                    state.uploads.remove(upload_id);
                    Ok(())
                }
                _ => Err(StoreError::NoSuchUpload(upload_id.to_string())),
            }
        })
    }

    fn get_object_range<'a>(&'a self, key: &'a str, start: u64) -> StoreFuture<'a, ByteStream> {
        Box::pin(async move {
            self.enter(StoreCall::GetRange {
                key: key.into(),
                start,
            })
            .await?;

            let mut state = self.lock();
            let data = state
                .objects
                .get(key)
                .map(|o| o.data.clone())
                .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))?;
            if start > data.len() as u64 {
                return Err(StoreError::Http {
                    status: 416,
                    message: "InvalidRange".into(),
                });
            }

            let mut body = data[start as usize..].to_vec();
            let fault = state.stream_faults.pop_front();
            drop(state);

            let mut items: Vec<Result<Vec<u8>, StoreError>> = Vec::new();
            let tail_error = fault.map(|f| {
                body.truncate((f.after_bytes as usize).min(body.len()));
                f.error
            });
            for chunk in body.chunks(self.stream_chunk) {
                items.push(Ok(chunk.to_vec()));
            }
            if let Some(err) = tail_error {
                items.push(Err(err));
            }

            let stream: ByteStream = match self.chunk_delay {
                Some(delay) => Box::pin(stream::iter(items).then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    item
                })),
                None => Box::pin(stream::iter(items)),
            };
            Ok(stream)
        })
    }
}
