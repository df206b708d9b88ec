use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::error::ClassifiedError;
use crate::types::{TaskId, TransferStatus};

/// Capacity of the event channel created by the manager.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Notification emitted while a task runs.
///
/// Events for one task are sent from that task's own unit of work, so they
/// arrive in the order they happened.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferEvent {
    #[serde(rename_all = "camelCase")]
    StatusChanged { id: TaskId, status: TransferStatus },
    #[serde(rename_all = "camelCase")]
    Progress {
        id: TaskId,
        /// Bytes added since the previous progress event.
        delta: u64,
        transferred: u64,
        total: u64,
        bytes_per_second: f64,
    },
    #[serde(rename_all = "camelCase")]
    PartCompleted { id: TaskId, part_number: u32 },
    /// `target` is the object key of an upload or the final local path of
    /// a download.
    Completed { id: TaskId, target: String },
    Failed { id: TaskId, error: ClassifiedError },
}

impl TransferEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TransferEvent::StatusChanged { id, .. }
            | TransferEvent::Progress { id, .. }
            | TransferEvent::PartCompleted { id, .. }
            | TransferEvent::Completed { id, .. }
            | TransferEvent::Failed { id, .. } => id,
        }
    }
}

/// Sending half of the event channel. May be detached.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<TransferEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<TransferEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops everything.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Sends `event`. A closed channel is ignored.
    ///
    /// Progress events are dropped when the channel is full; the next one
    /// carries the running total. Everything else waits for room.
    pub async fn emit(&self, event: TransferEvent) {
        let Some(tx) = &self.tx else { return };
        match event {
            TransferEvent::Progress { .. } => {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event) {
                    trace!("event channel full, dropping progress update");
                }
            }
            other => {
                let _ = tx.send(other).await;
            }
        }
    }

    /// Sends `event` if there is room, never waiting. Returns `false` when the
    /// event was dropped because the channel is full.
    pub fn try_emit(&self, event: TransferEvent) -> bool {
        let Some(tx) = &self.tx else { return true };
        !matches!(tx.try_send(event), Err(mpsc::error::TrySendError::Full(_)))
    }
}

// ---------------------------------------------------------------------------
// ProgressReporter
// ---------------------------------------------------------------------------

/// Turns byte deltas for one task into [`TransferEvent::Progress`] events.
pub struct ProgressReporter {
    id: TaskId,
    total: u64,
    transferred: u64,
    speed: SpeedWindow,
    sink: EventSink,
}

impl ProgressReporter {
    pub fn new(id: TaskId, total: u64, transferred: u64, sink: EventSink) -> Self {
        Self {
            id,
            total,
            transferred,
            speed: SpeedWindow::default(),
            sink,
        }
    }

    /// Records `delta` new bytes and emits a progress event.
    pub async fn advance(&mut self, delta: u64) {
        if delta == 0 {
            return;
        }
        self.transferred = self.transferred.saturating_add(delta);
        self.speed.record(delta);
        self.sink
            .emit(TransferEvent::Progress {
                id: self.id.clone(),
                delta,
                transferred: self.transferred,
                total: self.total,
                bytes_per_second: self.speed.bytes_per_second(),
            })
            .await;
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }
}

// ---------------------------------------------------------------------------
// SpeedWindow
// ---------------------------------------------------------------------------

/// How far back the speed estimate looks.
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Throughput over the last few seconds of progress.
#[derive(Debug)]
pub struct SpeedWindow {
    span: Duration,
    samples: VecDeque<(Instant, u64)>,
    bytes_in_window: u64,
}

impl Default for SpeedWindow {
    fn default() -> Self {
        Self::new(SPEED_WINDOW)
    }
}

impl SpeedWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            samples: VecDeque::new(),
            bytes_in_window: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.bytes_in_window = self.bytes_in_window.saturating_add(bytes);

        while let Some(&(at, old)) = self.samples.front() {
            if now.duration_since(at) <= self.span {
                break;
            }
            self.samples.pop_front();
            self.bytes_in_window -= old;
        }
    }

    /// Bytes per second between the oldest and newest sample in the window.
    /// Zero until two samples at distinct instants exist.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(&(first, _)), Some(&(last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last.duration_since(first);
        if elapsed.is_zero() {
            return 0.0;
        }
        self.bytes_in_window as f64 / elapsed.as_secs_f64()
    }
}
