//! Upload engine.
//!
//! Objects up to the multipart threshold go up in a single put. Larger ones
//! are split by the planner and their parts uploaded concurrently, each part
//! under the retry policy and the shared concurrency limiter. Any part that
//! finally fails aborts the whole multipart upload.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunked::read_range;
use crate::config::{EngineConfig, SharedConfig};
use crate::control::{TaskControl, fail_task, or_cancelled, set_status};
use crate::error::TransferError;
use crate::limiter::ConcurrencyLimiter;
use crate::planner::{effective_part_size, plan, should_use_multipart};
use crate::progress::{EventSink, ProgressReporter, TransferEvent};
use crate::retry::{Retry, RetryBudget, RetryPolicy, with_retry};
use crate::store::{CompletedPart, ObjectStore, timed};
use crate::types::{Direction, PartDescriptor, PartStatus, TransferStatus, TransferTask};
use crate::validation::validate_object_key;

/// Uploads local files to the object store.
pub struct UploadEngine {
    store: Arc<dyn ObjectStore>,
    config: SharedConfig,
    limiter: ConcurrencyLimiter,
}

impl UploadEngine {
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

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Uploads `task` from the beginning.
    ///
    /// Accepts a pending task, or a paused one that never got as far as a
    /// multipart upload. Returns the status the task settled in; a failure
    /// is returned as the error and recorded on the task.
    pub async fn start(
        &self,
        task: &mut TransferTask,
        control: &TaskControl,
        events: &EventSink,
    ) -> Result<TransferStatus, TransferError> {
        ensure_upload(task)?;
        set_status(task, TransferStatus::Active, events).await?;

        let cfg = self.config.snapshot();
        let budget = RetryBudget::new(task.max_retries, task.retry_count);
        let result = self.upload_fresh(task, &cfg, &budget, control, events).await;
        task.retry_count = budget.used();
        self.settle(task, result, &cfg, events).await
    }

    /// Continues the multipart upload `upload_id`.
    ///
    /// Parts the store already holds with a valid etag and the planned size
    /// are skipped; every other part is uploaded.
    pub async fn resume(
        &self,
        task: &mut TransferTask,
        upload_id: &str,
        control: &TaskControl,
        events: &EventSink,
    ) -> Result<TransferStatus, TransferError> {
        ensure_upload(task)?;
        set_status(task, TransferStatus::Active, events).await?;

        let cfg = self.config.snapshot();
        let budget = RetryBudget::new(task.max_retries, task.retry_count);
        let result = self
            .resume_parts(task, upload_id, &cfg, &budget, control, events)
            .await;
        task.retry_count = budget.used();
        self.settle(task, result, &cfg, events).await
    }

    /// Cancels a task that is not running, aborting its multipart upload.
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
        if let Some(upload_id) = task.upload_id.take() {
            let cfg = self.config.snapshot();
            self.abort(&task.object_key, &upload_id, &cfg).await;
        }
        set_status(task, TransferStatus::Cancelled, events).await
    }

    async fn settle(
        &self,
        task: &mut TransferTask,
        result: Result<(), TransferError>,
        cfg: &EngineConfig,
        events: &EventSink,
    ) -> Result<TransferStatus, TransferError> {
        match result {
            Ok(()) => {
                set_status(task, TransferStatus::Completed, events).await?;
                Ok(TransferStatus::Completed)
            }
            Err(TransferError::Paused) => {
                set_status(task, TransferStatus::Paused, events).await?;
                Ok(TransferStatus::Paused)
            }
            Err(err) => {
                if let Some(upload_id) = task.upload_id.take() {
                    self.abort(&task.object_key, &upload_id, cfg).await;
                }
                if matches!(err, TransferError::Cancelled) {
                    set_status(task, TransferStatus::Cancelled, events).await?;
                    return Ok(TransferStatus::Cancelled);
                }
                fail_task(task, &err, events).await;
                Err(err)
            }
        }
    }

    async fn upload_fresh(
        &self,
        task: &mut TransferTask,
        cfg: &EngineConfig,
        budget: &RetryBudget,
        control: &TaskControl,
        events: &EventSink,
    ) -> Result<(), TransferError> {
        validate_object_key(&task.object_key)?;
        let size = tokio::fs::metadata(&task.local_path).await?.len();
        task.total_bytes = size;
        task.reset_progress();
        task.upload_id = None;
        task.part_size_bytes = None;
        control.check()?;

        if !should_use_multipart(size, cfg.multipart_threshold_bytes) {
            return self.put_single(task, cfg, budget, control, events).await;
        }

        let part_size = effective_part_size(size, cfg.part_size_bytes);
        if part_size != cfg.part_size_bytes {
            info!(
                task = %task.id,
                configured = cfg.part_size_bytes,
                part_size,
                "part size raised to stay within the part limit"
            );
        }
        let parts = plan(size, part_size)?;

        let key = task.object_key.clone();
        let upload_id = Retry::new(&cfg.retry_policy, "create_multipart_upload")
            .cancel_on(control.cancel_token())
            .pause_on(control.pause_token())
            .budget(budget)
            .run(|| timed(cfg.request_timeout, self.store.create_multipart_upload(&key)))
            .await?;

        info!(
            task = %task.id,
            key = %key,
            upload_id = %upload_id,
            parts = parts.len(),
            part_size,
            "multipart upload started"
        );
        task.upload_id = Some(upload_id.clone());
        task.part_size_bytes = Some(part_size);

        self.upload_parts(task, &upload_id, parts, cfg, budget, control, events)
            .await
    }

    async fn put_single(
        &self,
        task: &mut TransferTask,
        cfg: &EngineConfig,
        budget: &RetryBudget,
        control: &TaskControl,
        events: &EventSink,
    ) -> Result<(), TransferError> {
        let body = tokio::fs::read(&task.local_path).await?;
        if body.len() as u64 != task.total_bytes {
            return Err(TransferError::SizeMismatch {
                expected: task.total_bytes,
                actual: body.len() as u64,
            });
        }

        let _permit = tokio::select! {
            biased;
            _ = control.cancel_token().cancelled() => return Err(TransferError::Cancelled),
            _ = control.pause_token().cancelled() => return Err(TransferError::Paused),
            permit = self.limiter.acquire() => permit,
        };

        let key = task.object_key.clone();
        let put = Retry::new(&cfg.retry_policy, "put_object")
            .cancel_on(control.cancel_token())
            .budget(budget)
            .run(|| timed(cfg.request_timeout, self.store.put_object(&key, body.clone())));
        let etag = or_cancelled(control.cancel_token(), put).await?;
        if etag.is_empty() {
            return Err(TransferError::MissingEtag(1));
        }

        debug!(task = %task.id, key = %key, etag = %etag, "single put done");
        let size = task.total_bytes;
        task.add_progress(size);
        ProgressReporter::new(task.id.clone(), size, 0, events.clone())
            .advance(size)
            .await;
        Ok(())
    }

    async fn resume_parts(
        &self,
        task: &mut TransferTask,
        upload_id: &str,
        cfg: &EngineConfig,
        budget: &RetryBudget,
        control: &TaskControl,
        events: &EventSink,
    ) -> Result<(), TransferError> {
        task.upload_id = Some(upload_id.to_string());
        validate_object_key(&task.object_key)?;

        let size = tokio::fs::metadata(&task.local_path).await?.len();
        if task.total_bytes != 0 && size != task.total_bytes {
            return Err(TransferError::SizeMismatch {
                expected: task.total_bytes,
                actual: size,
            });
        }
        task.total_bytes = size;

        let part_size = task
            .part_size_bytes
            .unwrap_or_else(|| effective_part_size(size, cfg.part_size_bytes));
        task.part_size_bytes = Some(part_size);
        let mut parts = plan(size, part_size)?;

        let key = task.object_key.clone();
        let listed = Retry::new(&cfg.retry_policy, "list_parts")
            .cancel_on(control.cancel_token())
            .pause_on(control.pause_token())
            .budget(budget)
            .run(|| timed(cfg.request_timeout, self.store.list_parts(&key, upload_id)))
            .await?;

        for uploaded in listed {
            let index = uploaded.part_number as usize;
            if index == 0 || index > parts.len() || uploaded.etag.is_empty() {
                debug!(task = %task.id, part = uploaded.part_number, "ignoring unusable listed part");
                continue;
            }
            let part = &mut parts[index - 1];
            if part.size_bytes == uploaded.size {
                part.mark_done(uploaded.etag);
            } else {
                debug!(
                    task = %task.id,
                    part = uploaded.part_number,
                    planned = part.size_bytes,
                    listed = uploaded.size,
                    "listed part has unexpected size, uploading again"
                );
            }
        }

        let done: u64 = parts.iter().filter(|p| p.is_done()).map(|p| p.size_bytes).sum();
        task.reset_progress();
        task.add_progress(done);
        info!(
            task = %task.id,
            upload_id = %upload_id,
            done_parts = parts.iter().filter(|p| p.is_done()).count(),
            total_parts = parts.len(),
            "resuming multipart upload"
        );

        self.upload_parts(task, upload_id, parts, cfg, budget, control, events)
            .await
    }

    /// Uploads every part not yet done, then completes the upload.
    ///
    /// At most `max_concurrent_transfers` parts of this task are dispatched
    /// at a time. Nothing new is dispatched once the task is paused,
    /// cancelled or a part has failed.
    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &self,
        task: &mut TransferTask,
        upload_id: &str,
        mut parts: Vec<PartDescriptor>,
        cfg: &EngineConfig,
        budget: &RetryBudget,
        control: &TaskControl,
        events: &EventSink,
    ) -> Result<(), TransferError> {
        let key = task.object_key.clone();
        let path = task.local_path.clone();
        let run_token = control.cancel_token().child_token();
        let window = cfg.max_concurrent_transfers.max(1);
        let mut reporter = ProgressReporter::new(
            task.id.clone(),
            task.total_bytes,
            task.transferred_bytes,
            events.clone(),
        );

        let mut queue: VecDeque<usize> = parts
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_done())
            .map(|(i, _)| i)
            .collect();
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<TransferError> = None;

        loop {
            while in_flight.len() < window && failure.is_none() && control.check().is_ok() {
                let Some(index) = queue.pop_front() else { break };
                let part = &mut parts[index];
                part.status = PartStatus::Uploading;
                let upload = self.upload_part(
                    PartJob {
                        key: &key,
                        upload_id,
                        path: &path,
                        part_number: part.part_number,
                        offset: part.offset,
                        size: part.size_bytes,
                    },
                    cfg,
                    budget,
                    control,
                    &run_token,
                );
                in_flight.push(upload.map(move |result| (index, result)));
            }

            let Some((index, result)) = in_flight.next().await else {
                break;
            };
            let part = &mut parts[index];
            match result {
                Ok(etag) => {
                    debug!(task = %task.id, part = part.part_number, etag = %etag, "part uploaded");
                    part.mark_done(etag);
                    task.add_progress(part.size_bytes);
                    reporter.advance(part.size_bytes).await;
                    events
                        .emit(TransferEvent::PartCompleted {
                            id: task.id.clone(),
                            part_number: part.part_number,
                        })
                        .await;
                }
                Err(err) if err.is_interruption() => {
                    part.status = PartStatus::Pending;
                }
                Err(err) => {
                    part.status = PartStatus::Failed;
                    warn!(task = %task.id, part = part.part_number, error = %err, "part failed, stopping upload");
                    if failure.is_none() {
                        run_token.cancel();
                        failure = Some(err);
                    }
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        control.check()?;

        let mut completed = Vec::with_capacity(parts.len());
        for part in &parts {
            match (&part.etag, part.is_done()) {
                (Some(etag), true) => completed.push(CompletedPart {
                    part_number: part.part_number,
                    etag: etag.clone(),
                }),
                _ => return Err(TransferError::MissingEtag(part.part_number)),
            }
        }

        let complete = Retry::new(&cfg.retry_policy, "complete_multipart_upload")
            .cancel_on(control.cancel_token())
            .budget(budget)
            .run(|| {
                timed(
                    cfg.request_timeout,
                    self.store
                        .complete_multipart_upload(&key, upload_id, completed.clone()),
                )
            });
        let etag = or_cancelled(control.cancel_token(), complete).await?;

        info!(task = %task.id, key = %key, etag = %etag, parts = parts.len(), "multipart upload completed");
        task.upload_id = None;
        Ok(())
    }

    async fn upload_part(
        &self,
        job: PartJob<'_>,
        cfg: &EngineConfig,
        budget: &RetryBudget,
        control: &TaskControl,
        run_token: &CancellationToken,
    ) -> Result<String, TransferError> {
        let _permit = tokio::select! {
            biased;
            _ = run_token.cancelled() => return Err(TransferError::Cancelled),
            _ = control.pause_token().cancelled() => return Err(TransferError::Paused),
            permit = self.limiter.acquire() => permit,
        };
        // The wait for a permit may have outlasted a pause.
        control.check()?;

        let body = read_range(job.path, job.offset, job.size).await?;
        let label = format!("upload_part {}", job.part_number);
        let upload = Retry::new(&cfg.retry_policy, &label)
            .cancel_on(run_token)
            .budget(budget)
            .run(|| {
                timed(
                    cfg.request_timeout,
                    self.store
                        .upload_part(job.key, job.upload_id, job.part_number, body.clone()),
                )
            });
        let etag = or_cancelled(run_token, upload).await?;

        if etag.is_empty() {
            return Err(TransferError::MissingEtag(job.part_number));
        }
        Ok(etag)
    }

    async fn abort(&self, key: &str, upload_id: &str, cfg: &EngineConfig) {
        let result = with_retry(&cfg.retry_policy, "abort_multipart_upload", || {
            timed(
                cfg.request_timeout,
                self.store.abort_multipart_upload(key, upload_id),
            )
        })
        .await;
        match result {
            Ok(()) => info!(key, upload_id, "multipart upload aborted"),
            Err(e) => warn!(key, upload_id, error = %e, "could not abort multipart upload"),
        }
    }
}

/// One part's worth of work.
#[derive(Clone, Copy)]
struct PartJob<'a> {
    key: &'a str,
    upload_id: &'a str,
    path: &'a Path,
    part_number: u32,
    offset: u64,
    size: u64,
}

fn ensure_upload(task: &TransferTask) -> Result<(), TransferError> {
    if task.direction != Direction::Upload {
        return Err(TransferError::InvalidConfig(format!(
            "task {} is not an upload",
            task.id
        )));
    }
    Ok(())
}
