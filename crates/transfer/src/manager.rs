//! Task registry and entry point for the UI layer.
//!
//! Every transfer runs in its own tokio task and owns its [`TransferTask`]
//! while it runs. The registry keeps a read-only mirror of each task,
//! refreshed from the task's events and replaced with the final state when
//! the run ends. Callers refer to tasks only by [`TaskId`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{EngineConfig, SharedConfig};
use crate::control::TaskControl;
use crate::download::{DownloadEngine, DownloadOptions};
use crate::error::TransferError;
use crate::limiter::ConcurrencyLimiter;
use crate::progress::{EVENT_CHANNEL_CAPACITY, EventSink, TransferEvent};
use crate::retry::RetryPolicy;
use crate::store::ObjectStore;
use crate::types::{Direction, TaskId, TransferStatus, TransferTask};
use crate::upload::UploadEngine;

type Registry = Arc<Mutex<HashMap<TaskId, TaskEntry>>>;

struct TaskEntry {
    task: TransferTask,
    options: DownloadOptions,
    control: TaskControl,
    running: bool,
    worker: Option<JoinHandle<()>>,
}

#[derive(Clone, Copy)]
enum Job {
    Start,
    Resume,
}

/// Runs uploads and downloads and tracks them by id.
pub struct TransferManager {
    uploads: Arc<UploadEngine>,
    downloads: Arc<DownloadEngine>,
    config: SharedConfig,
    tasks: Registry,
    events: EventSink,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
}

impl TransferManager {
    /// Creates a manager whose engines share `config` and one concurrency
    /// limiter.
    pub fn new(store: Arc<dyn ObjectStore>, config: EngineConfig) -> Result<Self, TransferError> {
        let limiter = ConcurrencyLimiter::new(config.max_concurrent_transfers);
        let config = SharedConfig::new(config)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            uploads: Arc::new(UploadEngine::with_shared(
                Arc::clone(&store),
                config.clone(),
                limiter.clone(),
            )),
            downloads: Arc::new(DownloadEngine::with_shared(store, config.clone(), limiter)),
            config,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            events: EventSink::new(events_tx),
            events_rx: Some(events_rx),
        })
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    pub fn config(&self) -> EngineConfig {
        self.config.snapshot()
    }

    /// Replaces the retry policy for operations started from now on.
    pub fn set_retry_policy(&self, policy: RetryPolicy) -> Result<(), TransferError> {
        self.config.set_retry_policy(policy)
    }

    /// Builds a pending upload carrying the configured retry budget.
    pub fn upload_task(&self, object_key: impl Into<String>, local_path: impl Into<PathBuf>) -> TransferTask {
        TransferTask::upload(object_key, local_path)
            .with_max_retries(self.config.snapshot().max_task_retries)
    }

    /// Builds a pending download carrying the configured retry budget.
    pub fn download_task(&self, object_key: impl Into<String>, local_path: impl Into<PathBuf>) -> TransferTask {
        TransferTask::download(object_key, local_path)
            .with_max_retries(self.config.snapshot().max_task_retries)
    }

    /// Starts uploading a pending task.
    pub fn start_upload(&self, task: TransferTask) -> Result<TaskId, TransferError> {
        self.submit(task, Direction::Upload, DownloadOptions::default())
    }

    /// Starts downloading a pending task.
    pub fn start_download(
        &self,
        task: TransferTask,
        options: DownloadOptions,
    ) -> Result<TaskId, TransferError> {
        self.submit(task, Direction::Download, options)
    }

    fn submit(
        &self,
        task: TransferTask,
        direction: Direction,
        options: DownloadOptions,
    ) -> Result<TaskId, TransferError> {
        if task.direction != direction {
            return Err(TransferError::InvalidConfig(format!(
                "task {} has the wrong direction",
                task.id
            )));
        }
        if task.status() != TransferStatus::Pending {
            return Err(TransferError::InvalidTransition {
                from: task.status(),
                to: TransferStatus::Active,
            });
        }

        let id = task.id.clone();
        let mut tasks = lock(&self.tasks);
        if tasks.contains_key(&id) {
            return Err(TransferError::InvalidConfig(format!("duplicate task id {id}")));
        }

        let control = TaskControl::new();
        let worker = self.spawn(task.clone(), Job::Start, control.clone(), options);
        tasks.insert(
            id.clone(),
            TaskEntry {
                task,
                options,
                control,
                running: true,
                worker: Some(worker),
            },
        );
        debug!(task = %id, ?direction, "transfer submitted");
        Ok(id)
    }

    /// Asks a running task to pause. The task reports `paused` once its
    /// in-flight requests have settled.
    pub fn pause(&self, id: &TaskId) -> Result<(), TransferError> {
        let tasks = lock(&self.tasks);
        let entry = tasks
            .get(id)
            .ok_or_else(|| TransferError::TaskNotFound(id.to_string()))?;
        if !entry.running {
            return Err(TransferError::InvalidTransition {
                from: entry.task.status(),
                to: TransferStatus::Paused,
            });
        }
        entry.control.pause();
        Ok(())
    }

    /// Resumes a paused task.
    pub fn resume(&self, id: &TaskId) -> Result<(), TransferError> {
        let mut tasks = lock(&self.tasks);
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| TransferError::TaskNotFound(id.to_string()))?;
        if entry.running {
            return Err(TransferError::TaskRunning(id.to_string()));
        }
        if entry.task.status() != TransferStatus::Paused {
            return Err(TransferError::InvalidTransition {
                from: entry.task.status(),
                to: TransferStatus::Active,
            });
        }

        entry.control = TaskControl::new();
        entry.running = true;
        entry.worker = Some(self.spawn(
            entry.task.clone(),
            Job::Resume,
            entry.control.clone(),
            entry.options,
        ));
        Ok(())
    }

    /// Cancels a task.
    ///
    /// A running task is signalled and settles on its own. A paused task is
    /// cancelled here: its multipart upload is aborted, or its partial
    /// download removed if it never made progress.
    pub async fn cancel(&self, id: &TaskId) -> Result<(), TransferError> {
        let mut task = {
            let mut tasks = lock(&self.tasks);
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| TransferError::TaskNotFound(id.to_string()))?;
            if entry.running {
                entry.control.cancel();
                return Ok(());
            }
            if entry.task.status().is_terminal() {
                return Err(TransferError::InvalidTransition {
                    from: entry.task.status(),
                    to: TransferStatus::Cancelled,
                });
            }
            entry.running = true;
            entry.task.clone()
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let run = async {
            let sink = EventSink::new(tx);
            match task.direction {
                Direction::Upload => self.uploads.cancel(&mut task, &sink).await,
                Direction::Download => self.downloads.cancel(&mut task, &sink).await,
            }
        };
        let (result, ()) = tokio::join!(run, forward_events(&self.tasks, &self.events, rx));

        if let Some(entry) = lock(&self.tasks).get_mut(id) {
            entry.task = task;
            entry.running = false;
        }
        result
    }

    /// Latest known state of a task.
    pub fn task(&self, id: &TaskId) -> Option<TransferTask> {
        lock(&self.tasks).get(id).map(|e| e.task.clone())
    }

    /// All tracked tasks, oldest first.
    pub fn tasks(&self) -> Vec<TransferTask> {
        let mut all: Vec<_> = lock(&self.tasks).values().map(|e| e.task.clone()).collect();
        all.sort_by_key(|t| t.created_at);
        all
    }

    /// Stops tracking a finished task.
    pub fn remove(&self, id: &TaskId) -> Result<TransferTask, TransferError> {
        let mut tasks = lock(&self.tasks);
        let entry = tasks
            .get(id)
            .ok_or_else(|| TransferError::TaskNotFound(id.to_string()))?;
        if entry.running || !entry.task.status().is_terminal() {
            return Err(TransferError::TaskRunning(id.to_string()));
        }
        tasks
            .remove(id)
            .map(|e| e.task)
            .ok_or_else(|| TransferError::TaskNotFound(id.to_string()))
    }

    /// Stops tracking every finished task. Returns how many were dropped.
    pub fn clear_finished(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        let before = tasks.len();
        tasks.retain(|_, e| e.running || !e.task.status().is_terminal());
        before - tasks.len()
    }

    /// Waits for the current run of a task to end and returns its state.
    pub async fn wait(&self, id: &TaskId) -> Option<TransferTask> {
        let worker = lock(&self.tasks).get_mut(id)?.worker.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(task = %id, error = %e, "transfer worker ended abnormally");
            }
        }
        self.task(id)
    }

    fn spawn(
        &self,
        task: TransferTask,
        job: Job,
        control: TaskControl,
        options: DownloadOptions,
    ) -> JoinHandle<()> {
        let uploads = Arc::clone(&self.uploads);
        let downloads = Arc::clone(&self.downloads);
        let registry = Arc::clone(&self.tasks);
        let public = self.events.clone();
        let id = task.id.clone();

        tokio::spawn(async move {
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let sink = EventSink::new(tx);

            let run = async move {
                let mut task = task;
                let result = match (task.direction, job) {
                    (Direction::Upload, Job::Start) => uploads.start(&mut task, &control, &sink).await,
                    (Direction::Upload, Job::Resume) => match task.upload_id.clone() {
                        Some(upload_id) => {
                            uploads.resume(&mut task, &upload_id, &control, &sink).await
                        }
                        None => uploads.start(&mut task, &control, &sink).await,
                    },
                    (Direction::Download, Job::Start) => {
                        downloads.start(&mut task, options, &control, &sink).await
                    }
                    (Direction::Download, Job::Resume) => {
                        downloads.resume(&mut task, &control, &sink).await
                    }
                };
                if let Err(e) = &result {
                    debug!(task = %task.id, error = %e, "transfer run ended with error");
                }

                // A cancel that arrived while the run was settling into pause.
                if task.status() == TransferStatus::Paused && control.is_cancelled() {
                    let cancelled = match task.direction {
                        Direction::Upload => uploads.cancel(&mut task, &sink).await,
                        Direction::Download => downloads.cancel(&mut task, &sink).await,
                    };
                    if let Err(e) = cancelled {
                        warn!(task = %task.id, error = %e, "could not cancel paused task");
                    }
                }
                task
            };

            let (task, ()) = tokio::join!(run, forward_events(&registry, &public, rx));
            if let Some(entry) = lock(&registry).get_mut(&id) {
                entry.task = task;
                entry.running = false;
            }
        })
    }
}

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mirrors a run's events into the registry and passes them on to the
/// public channel.
///
/// The public channel is offered each event without waiting, so a caller
/// that never reads events cannot stall a run. The registry mirror is kept
/// current either way.
async fn forward_events(
    registry: &Registry,
    public: &EventSink,
    mut rx: mpsc::Receiver<TransferEvent>,
) {
    let mut dropped: u64 = 0;
    while let Some(event) = rx.recv().await {
        mirror(registry, &event);
        if !public.try_emit(event) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        debug!(dropped, "event channel full, events dropped");
    }
}

/// Applies a running task's event to its registry mirror.
fn mirror(registry: &Registry, event: &TransferEvent) {
    let mut tasks = lock(registry);
    let Some(entry) = tasks.get_mut(event.task_id()) else {
        return;
    };
    match event {
        TransferEvent::StatusChanged { id, status } => {
            if let Err(e) = entry.task.transition(*status) {
                debug!(task = %id, error = %e, "registry mirror skipped status change");
            }
        }
        TransferEvent::Progress {
            transferred, total, ..
        } => {
            entry.task.total_bytes = *total;
            entry.task.transferred_bytes = *transferred;
        }
        TransferEvent::Failed { error, .. } => {
            entry.task.error = Some(error.clone());
        }
        TransferEvent::PartCompleted { .. } | TransferEvent::Completed { .. } => {}
    }
}
