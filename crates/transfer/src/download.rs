//! Download engine.
//!
//! A download runs a pre-flight phase (object metadata, destination checks,
//! partial-file detection, disk space) and then streams the object into the
//! destination with sequential appends. A retryable failure in the middle of
//! the stream reopens the range at the last byte written.

use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunked::{AppendWriter, file_checksum_async};
use crate::config::{EngineConfig, SharedConfig};
use crate::control::{TaskControl, fail_task, set_status};
use crate::disk::check_disk_space_async;
use crate::error::{Classify, StoreError, TransferError};
use crate::limiter::ConcurrencyLimiter;
use crate::progress::{EventSink, ProgressReporter};
use crate::retry::{Retry, RetryBudget, RetryPolicy};
use crate::store::{ObjectStore, timed};
use crate::types::{Direction, TransferStatus, TransferTask};
use crate::validation::{
    unique_destination_async, validate_download_path_async, validate_object_key,
};

/// Per-download options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadOptions {
    /// Continue from an existing file at the destination instead of writing
    /// to a fresh `name (N).ext` path next to it.
    pub resumable: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self { resumable: true }
    }
}

/// What pre-flight found out.
struct Preflight {
    offset: u64,
    checksum: Option<String>,
}

/// Downloads objects from the store to local files.
pub struct DownloadEngine {
    store: Arc<dyn ObjectStore>,
    config: SharedConfig,
    limiter: ConcurrencyLimiter,
}

impl DownloadEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: EngineConfig) -> Result<Self, TransferError> {
        let limiter = ConcurrencyLimiter::new(config.max_concurrent_transfers);
        Ok(Self::with_shared(store, SharedConfig::new(config)?, limiter))
    }

    /// Builds an engine sharing its configuration and limiter with others.
    pub fn with_shared(
        store: Arc<dyn ObjectStore>,
        config: SharedConfig,
        limiter: ConcurrencyLimiter,
    ) -> Self {
        Self {
            store,
            config,
            limiter,
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.config.snapshot()
    }

    pub fn set_retry_policy(&self, policy: RetryPolicy) -> Result<(), TransferError> {
        self.config.set_retry_policy(policy)
    }

    /// Downloads a pending task. Pre-flight runs before the task goes active.
    ///
    /// Returns the status the task settled in; a failure is returned as the
    /// error and recorded on the task.
    pub async fn start(
        &self,
        task: &mut TransferTask,
        options: DownloadOptions,
        control: &TaskControl,
        events: &EventSink,
    ) -> Result<TransferStatus, TransferError> {
        ensure_download(task)?;
        if task.status() != TransferStatus::Pending {
            return Err(TransferError::InvalidTransition {
                from: task.status(),
                to: TransferStatus::Active,
            });
        }
        self.run(task, options, control, events).await
    }

    /// Continues a paused task from the bytes already on disk.
    pub async fn resume(
        &self,
        task: &mut TransferTask,
        control: &TaskControl,
        events: &EventSink,
    ) -> Result<TransferStatus, TransferError> {
        ensure_download(task)?;
        set_status(task, TransferStatus::Active, events).await?;
        self.run(task, DownloadOptions { resumable: true }, control, events)
            .await
    }

    /// Cancels a task that is not running.
    ///
    /// The partial file is deleted only when the task never made progress.
    pub async fn cancel(
        &self,
        task: &mut TransferTask,
        events: &EventSink,
    ) -> Result<(), TransferError> {
        if task.status().is_terminal() {
            return Err(TransferError::InvalidTransition {
                from: task.status(),
                to: TransferStatus::Cancelled,
            });
        }
        if task.transferred_bytes == 0 {
            remove_partial(&task.local_path).await;
        }
        set_status(task, TransferStatus::Cancelled, events).await
    }

    async fn run(
        &self,
        task: &mut TransferTask,
        options: DownloadOptions,
        control: &TaskControl,
        events: &EventSink,
    ) -> Result<TransferStatus, TransferError> {
        let cfg = self.config.snapshot();
        let budget = RetryBudget::new(task.max_retries, task.retry_count);
        let mut prior_offset = None;

        let result = self
            .run_inner(task, options, &cfg, &budget, control, events, &mut prior_offset)
            .await;
        task.retry_count = budget.used();

        match result {
            Ok(()) => {
                set_status(task, TransferStatus::Completed, events).await?;
                Ok(TransferStatus::Completed)
            }
            Err(TransferError::Paused) => {
                // Paused during pre-flight, before the task went active.
                if task.status() == TransferStatus::Pending {
                    set_status(task, TransferStatus::Active, events).await?;
                }
                set_status(task, TransferStatus::Paused, events).await?;
                Ok(TransferStatus::Paused)
            }
            Err(TransferError::Cancelled) => {
                if prior_offset == Some(0) {
                    remove_partial(&task.local_path).await;
                }
                set_status(task, TransferStatus::Cancelled, events).await?;
                Ok(TransferStatus::Cancelled)
            }
            Err(err) => {
                fail_task(task, &err, events).await;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_inner(
        &self,
        task: &mut TransferTask,
        options: DownloadOptions,
        cfg: &EngineConfig,
        budget: &RetryBudget,
        control: &TaskControl,
        events: &EventSink,
        prior_offset: &mut Option<u64>,
    ) -> Result<(), TransferError> {
        let preflight = self.preflight(task, options, cfg, budget, control).await?;
        if task.status() == TransferStatus::Pending {
            set_status(task, TransferStatus::Active, events).await?;
        }
        *prior_offset = Some(preflight.offset);

        self.transfer(task, preflight.offset, cfg, budget, control, events)
            .await?;
        self.verify(task, preflight.checksum.as_deref()).await
    }

    async fn preflight(
        &self,
        task: &mut TransferTask,
        options: DownloadOptions,
        cfg: &EngineConfig,
        budget: &RetryBudget,
        control: &TaskControl,
    ) -> Result<Preflight, TransferError> {
        validate_object_key(&task.object_key)?;
        validate_download_path_async(&task.local_path).await?;

        let key = task.object_key.clone();
        let meta = Retry::new(&cfg.retry_policy, "head_object")
            .cancel_on(control.cancel_token())
            .pause_on(control.pause_token())
            .budget(budget)
            .run(|| timed(cfg.request_timeout, self.store.head_object(&key)))
            .await?;

        let mut offset = 0;
        match tokio::fs::metadata(&task.local_path).await {
            Ok(existing) => {
                let existing = existing.len();
                if !options.resumable {
                    let fresh = unique_destination_async(&task.local_path).await?;
                    info!(
                        task = %task.id,
                        from = %task.local_path.display(),
                        to = %fresh.display(),
                        "destination exists, downloading to a new file"
                    );
                    task.local_path = fresh;
                } else if task.remote_etag.as_deref().is_some_and(|etag| etag != meta.etag) {
                    info!(task = %task.id, key = %key, "remote object changed, restarting from zero");
                } else if existing > meta.size {
                    info!(
                        task = %task.id,
                        existing,
                        size = meta.size,
                        "partial file larger than object, restarting from zero"
                    );
                } else {
                    offset = existing;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        task.total_bytes = meta.size;
        task.remote_etag = Some(meta.etag);
        task.reset_progress();
        task.add_progress(offset);

        check_disk_space_async(&task.local_path, meta.size - offset).await?;
        debug!(task = %task.id, key = %key, size = meta.size, offset, "pre-flight passed");

        Ok(Preflight {
            offset,
            checksum: meta.checksum_sha256,
        })
    }

    /// Streams bytes `[offset, total)` into the destination.
    async fn transfer(
        &self,
        task: &mut TransferTask,
        offset: u64,
        cfg: &EngineConfig,
        budget: &RetryBudget,
        control: &TaskControl,
        events: &EventSink,
    ) -> Result<(), TransferError> {
        let total = task.total_bytes;
        let mut writer = AppendWriter::open(&task.local_path, offset == 0).await?;
        if writer.offset() != offset {
            return Err(TransferError::SizeMismatch {
                expected: offset,
                actual: writer.offset(),
            });
        }
        if offset >= total {
            return Ok(());
        }

        let _permit = tokio::select! {
            biased;
            e = control.interrupted() => return Err(e),
            permit = self.limiter.acquire() => permit,
        };

        let key = task.object_key.clone();
        let mut reporter =
            ProgressReporter::new(task.id.clone(), total, offset, events.clone());
        // Consecutive stream sessions that ended in an error.
        let mut failures: u32 = 0;

        loop {
            control.check()?;
            let start = writer.offset();
            debug!(task = %task.id, start, "opening range");
            let mut stream = Retry::new(&cfg.retry_policy, "get_object_range")
                .cancel_on(control.cancel_token())
                .pause_on(control.pause_token())
                .budget(budget)
                .run(|| timed(cfg.request_timeout, self.store.get_object_range(&key, start)))
                .await?;

            let err: TransferError = loop {
                let next = tokio::select! {
                    biased;
                    e = control.interrupted() => {
                        writer.sync().await?;
                        return Err(e);
                    }
                    next = tokio::time::timeout(cfg.request_timeout, stream.next()) => next,
                };
                match next {
                    Err(_) => break StoreError::Timeout.into(),
                    Ok(None) if writer.offset() == total => {
                        writer.sync().await?;
                        info!(task = %task.id, key = %key, bytes = total, "download stream finished");
                        return Ok(());
                    }
                    Ok(None) => {
                        break StoreError::ConnectionReset(format!(
                            "stream ended at byte {} of {total}",
                            writer.offset()
                        ))
                        .into();
                    }
                    Ok(Some(Err(e))) => break e.into(),
                    Ok(Some(Ok(chunk))) => {
                        let len = chunk.len() as u64;
                        if writer.offset() + len > total {
                            return Err(TransferError::SizeMismatch {
                                expected: total,
                                actual: writer.offset() + len,
                            });
                        }
                        writer.append(&chunk).await?;
                        task.add_progress(len);
                        reporter.advance(len).await;
                        failures = 0;
                    }
                }
            };

            failures += 1;
            let classified = err.classify();
            if !cfg.retry_policy.should_retry(&classified, failures) {
                writer.sync().await?;
                return Err(err);
            }
            if !budget.try_consume() {
                warn!(task = %task.id, error = %err, "task retry budget exhausted");
                writer.sync().await?;
                return Err(err);
            }

            let delay = cfg.retry_policy.compute_delay(failures);
            warn!(
                task = %task.id,
                offset = writer.offset(),
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "download stream interrupted, reopening"
            );
            tokio::select! {
                biased;
                e = control.interrupted() => {
                    writer.sync().await?;
                    return Err(e);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn verify(&self, task: &TransferTask, checksum: Option<&str>) -> Result<(), TransferError> {
        let actual = tokio::fs::metadata(&task.local_path).await?.len();
        if actual != task.total_bytes {
            return Err(TransferError::SizeMismatch {
                expected: task.total_bytes,
                actual,
            });
        }

        if let Some(expected) = checksum {
            let actual = file_checksum_async(&task.local_path).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                remove_partial(&task.local_path).await;
                return Err(TransferError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
            debug!(task = %task.id, "checksum verified");
        }
        Ok(())
    }
}

fn ensure_download(task: &TransferTask) -> Result<(), TransferError> {
    if task.direction != Direction::Download {
        return Err(TransferError::InvalidConfig(format!(
            "task {} is not a download",
            task.id
        )));
    }
    Ok(())
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "partial file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, StoreOp};
    use crate::progress::TransferEvent;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn engine(store: &Arc<MemoryStore>) -> DownloadEngine {
        let config = EngineConfig {
            retry_policy: fast_policy(),
            ..Default::default()
        };
        let store: Arc<dyn ObjectStore> = store.clone();
        DownloadEngine::new(store, config).unwrap()
    }

    fn object(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    async fn run(
        engine: &DownloadEngine,
        task: &mut TransferTask,
        options: DownloadOptions,
    ) -> Result<TransferStatus, TransferError> {
        engine
            .start(task, options, &TaskControl::new(), &EventSink::detached())
            .await
    }

    #[tokio::test]
    async fn downloads_whole_object() {
        let dir = TempDir::new().unwrap();
        let data = object(1000);
        let store = Arc::new(MemoryStore::new().with_stream_chunk(64));
        store.insert_object("k", data.clone());
        let engine = engine(&store);

        let (tx, mut rx) = mpsc::channel(256);
        let dest = dir.path().join("out.bin");
        let mut task = TransferTask::download("k", &dest);
        let status = engine
            .start(&mut task, DownloadOptions::default(), &TaskControl::new(), &EventSink::new(tx))
            .await
            .unwrap();

        assert_eq!(status, TransferStatus::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(task.transferred_bytes, 1000);
        assert_eq!(task.total_bytes, 1000);
        assert!(task.remote_etag.is_some());

        let mut delta_sum = 0;
        let mut last_total = 0;
        while let Ok(event) = rx.try_recv() {
            if let TransferEvent::Progress {
                delta, transferred, ..
            } = event
            {
                assert!(transferred > last_total);
                delta_sum += delta;
                last_total = transferred;
            }
        }
        assert_eq!(delta_sum, 1000);
    }

    #[tokio::test]
    async fn resumes_from_partial_file() {
        let dir = TempDir::new().unwrap();
        let data = object(500);
        let store = Arc::new(MemoryStore::new());
        store.insert_object("k", data.clone());
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, &data[..120]).unwrap();
        let engine = engine(&store);

        let mut task = TransferTask::download("k", &dest);
        run(&engine, &mut task, DownloadOptions::default()).await.unwrap();

        assert_eq!(store.range_starts(), vec![120]);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn reopens_at_last_written_byte() {
        let dir = TempDir::new().unwrap();
        let data = object(300);
        let store = Arc::new(MemoryStore::new().with_stream_chunk(10));
        store.insert_object("k", data.clone());
        store.fail_stream_after(100, StoreError::ConnectionReset("peer".into()));
        let engine = engine(&store);

        let dest = dir.path().join("out.bin");
        let mut task = TransferTask::download("k", &dest);
        run(&engine, &mut task, DownloadOptions::default()).await.unwrap();

        assert_eq!(store.range_starts(), vec![0, 100]);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn non_retryable_stream_error_fails_and_keeps_file() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new().with_stream_chunk(10));
        store.insert_object("k", object(300));
        store.fail_stream_after(50, StoreError::AccessDenied("k".into()));
        let engine = engine(&store);

        let dest = dir.path().join("out.bin");
        let mut task = TransferTask::download("k", &dest);
        assert!(run(&engine, &mut task, DownloadOptions::default()).await.is_err());

        assert_eq!(task.status(), TransferStatus::Failed);
        assert_eq!(store.range_starts(), vec![0]);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 50);
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_error() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new().with_stream_chunk(10));
        store.insert_object("k", object(300));
        for _ in 0..3 {
            store.fail_stream_after(10, StoreError::Timeout);
        }
        let engine = engine(&store);

        let mut task = TransferTask::download("k", dir.path().join("out.bin")).with_max_retries(1);
        let err = run(&engine, &mut task, DownloadOptions::default()).await.unwrap_err();
        assert!(matches!(err, TransferError::Store(StoreError::Timeout)));
        assert_eq!(store.range_starts(), vec![0, 10]);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn changed_remote_object_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let data = object(200);
        let store = Arc::new(MemoryStore::new());
        store.insert_object("k", data.clone());
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, vec![9u8; 50]).unwrap();
        let engine = engine(&store);

        let mut task = TransferTask::download("k", &dest);
        task.remote_etag = Some("\"stale\"".into());
        run(&engine, &mut task, DownloadOptions::default()).await.unwrap();

        assert_eq!(store.range_starts(), vec![0]);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn oversized_partial_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let data = object(100);
        let store = Arc::new(MemoryStore::new());
        store.insert_object("k", data.clone());
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, vec![0u8; 150]).unwrap();
        let engine = engine(&store);

        let mut task = TransferTask::download("k", &dest);
        run(&engine, &mut task, DownloadOptions::default()).await.unwrap();
        assert_eq!(store.range_starts(), vec![0]);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn complete_partial_skips_transfer() {
        let dir = TempDir::new().unwrap();
        let data = object(100);
        let store = Arc::new(MemoryStore::new());
        store.insert_object("k", data.clone());
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, &data).unwrap();
        let engine = engine(&store);

        let mut task = TransferTask::download("k", &dest);
        let status = run(&engine, &mut task, DownloadOptions::default()).await.unwrap();
        assert_eq!(status, TransferStatus::Completed);
        assert_eq!(store.count(StoreOp::GetRange), 0);
        assert_eq!(task.transferred_bytes, 100);
    }

    #[tokio::test]
    async fn non_resumable_picks_fresh_name() {
        let dir = TempDir::new().unwrap();
        let data = object(64);
        let store = Arc::new(MemoryStore::new());
        store.insert_object("k", data.clone());
        let dest = dir.path().join("report.pdf");
        std::fs::write(&dest, b"keep me").unwrap();
        let engine = engine(&store);

        let mut task = TransferTask::download("k", &dest);
        run(&engine, &mut task, DownloadOptions { resumable: false })
            .await
            .unwrap();

        assert_eq!(task.local_path, dir.path().join("report (1).pdf"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"keep me");
        assert_eq!(std::fs::read(&task.local_path).unwrap(), data);
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_and_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_object("k", object(64));
        store.set_checksum("k", &"0".repeat(64));
        let engine = engine(&store);

        let dest = dir.path().join("out.bin");
        let mut task = TransferTask::download("k", &dest);
        let err = run(&engine, &mut task, DownloadOptions::default()).await.unwrap_err();

        assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
        assert!(!dest.exists());
        assert_eq!(task.error.as_ref().unwrap().category(), crate::ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn missing_object_fails_in_preflight() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);

        let mut task = TransferTask::download("nope", dir.path().join("out.bin"));
        let err = run(&engine, &mut task, DownloadOptions::default()).await.unwrap_err();
        assert!(matches!(err, TransferError::Store(StoreError::NoSuchKey(_))));
        assert_eq!(task.status(), TransferStatus::Failed);
        assert_eq!(store.count(StoreOp::Head), 1);
        assert_eq!(store.count(StoreOp::GetRange), 0);
    }

    #[tokio::test]
    async fn relative_destination_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.insert_object("k", object(10));
        let engine = engine(&store);
        let mut task = TransferTask::download("k", "relative/out.bin");
        let err = run(&engine, &mut task, DownloadOptions::default()).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidPath(_)));
        assert!(store.calls().is_empty());
    }

    fn slow_store(data: &[u8]) -> Arc<MemoryStore> {
        let store = Arc::new(
            MemoryStore::new()
                .with_stream_chunk(10)
                .with_chunk_delay(Duration::from_millis(10)),
        );
        store.insert_object("k", data.to_vec());
        store
    }

    #[tokio::test]
    async fn pause_keeps_partial_and_resume_continues() {
        let dir = TempDir::new().unwrap();
        let data = object(200);
        let store = slow_store(&data);
        let engine = engine(&store);
        let dest = dir.path().join("out.bin");

        let control = TaskControl::new();
        let pauser = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(55)).await;
            pauser.pause();
        });

        let mut task = TransferTask::download("k", &dest);
        let status = engine
            .start(&mut task, DownloadOptions::default(), &control, &EventSink::detached())
            .await
            .unwrap();
        assert_eq!(status, TransferStatus::Paused);

        let written = std::fs::metadata(&dest).unwrap().len();
        assert!(written > 0 && written < 200);
        assert_eq!(task.transferred_bytes, written);

        let status = engine
            .resume(&mut task, &TaskControl::new(), &EventSink::detached())
            .await
            .unwrap();
        assert_eq!(status, TransferStatus::Completed);
        assert_eq!(store.range_starts(), vec![0, written]);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn cancel_fresh_download_deletes_partial() {
        let dir = TempDir::new().unwrap();
        let store = slow_store(&object(200));
        let engine = engine(&store);
        let dest = dir.path().join("out.bin");

        let control = TaskControl::new();
        let canceller = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(55)).await;
            canceller.cancel();
        });

        let mut task = TransferTask::download("k", &dest);
        let status = engine
            .start(&mut task, DownloadOptions::default(), &control, &EventSink::detached())
            .await
            .unwrap();
        assert_eq!(status, TransferStatus::Cancelled);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn cancel_resumed_download_keeps_partial() {
        let dir = TempDir::new().unwrap();
        let data = object(200);
        let store = slow_store(&data);
        let engine = engine(&store);
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, &data[..40]).unwrap();

        let control = TaskControl::new();
        let canceller = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            canceller.cancel();
        });

        let mut task = TransferTask::download("k", &dest);
        let status = engine
            .start(&mut task, DownloadOptions::default(), &control, &EventSink::detached())
            .await
            .unwrap();
        assert_eq!(status, TransferStatus::Cancelled);
        assert!(std::fs::metadata(&dest).unwrap().len() >= 40);
    }

    #[tokio::test]
    async fn cancel_paused_without_progress_deletes_file() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, b"").unwrap();

        let mut task = TransferTask::download("k", &dest);
        task.transition(TransferStatus::Active).unwrap();
        task.transition(TransferStatus::Paused).unwrap();
        engine.cancel(&mut task, &EventSink::detached()).await.unwrap();

        assert_eq!(task.status(), TransferStatus::Cancelled);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn cancel_paused_with_progress_keeps_file() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, b"partial").unwrap();

        let mut task = TransferTask::download("k", &dest);
        task.transition(TransferStatus::Active).unwrap();
        task.add_progress(7);
        task.transition(TransferStatus::Paused).unwrap();
        engine.cancel(&mut task, &EventSink::detached()).await.unwrap();

        assert!(dest.exists());
    }

    fn slow_backoff_engine(store: &Arc<MemoryStore>) -> DownloadEngine {
        let config = EngineConfig {
            retry_policy: RetryPolicy {
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(30),
                ..Default::default()
            },
            ..Default::default()
        };
        let store: Arc<dyn ObjectStore> = store.clone();
        DownloadEngine::new(store, config).unwrap()
    }

    fn pause_after(control: &TaskControl, after: Duration) {
        let pauser = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            pauser.pause();
        });
    }

    #[tokio::test]
    async fn pause_cuts_head_backoff_short() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_object("k", object(100));
        store.fail_next(StoreOp::Head, StoreError::Timeout);
        let engine = slow_backoff_engine(&store);

        let control = TaskControl::new();
        pause_after(&control, Duration::from_millis(50));

        let mut task = TransferTask::download("k", dir.path().join("out.bin"));
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            engine.start(&mut task, DownloadOptions::default(), &control, &EventSink::detached()),
        )
        .await
        .expect("pause waited out the backoff")
        .unwrap();

        assert_eq!(status, TransferStatus::Paused);
        assert_eq!(task.status(), TransferStatus::Paused);
        assert_eq!(store.count(StoreOp::Head), 1);

        let status = engine
            .resume(&mut task, &TaskControl::new(), &EventSink::detached())
            .await
            .unwrap();
        assert_eq!(status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn pause_cuts_range_backoff_short() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_object("k", object(100));
        store.fail_next(StoreOp::GetRange, StoreError::ConnectionRefused("down".into()));
        let engine = slow_backoff_engine(&store);

        let control = TaskControl::new();
        pause_after(&control, Duration::from_millis(50));

        let mut task = TransferTask::download("k", dir.path().join("out.bin"));
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            engine.start(&mut task, DownloadOptions::default(), &control, &EventSink::detached()),
        )
        .await
        .expect("pause waited out the backoff")
        .unwrap();

        assert_eq!(status, TransferStatus::Paused);
        assert_eq!(store.count(StoreOp::GetRange), 1);
    }
}
