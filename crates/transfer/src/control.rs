//! Cooperative pause/cancel signals and status bookkeeping shared by the
//! engines.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Classify, ClassifiedError, TransferError};
use crate::progress::{EventSink, TransferEvent};
use crate::types::{Direction, TransferStatus, TransferTask};

/// Pause and cancel signals for one run of a task.
///
/// Signals are one-shot; a resumed task gets a fresh control.
#[derive(Debug, Clone, Default)]
pub struct TaskControl {
    cancel: CancellationToken,
    pause: CancellationToken,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops dispatching new work. In-flight requests may finish.
    pub fn pause(&self) {
        self.pause.cancel();
    }

    /// Stops dispatching new work and interrupts in-flight requests.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn pause_token(&self) -> &CancellationToken {
        &self.pause
    }

    /// Returns the pending interruption, cancel taking precedence.
    pub fn check(&self) -> Result<(), TransferError> {
        if self.is_cancelled() {
            Err(TransferError::Cancelled)
        } else if self.is_paused() {
            Err(TransferError::Paused)
        } else {
            Ok(())
        }
    }

    /// Resolves once the task is paused or cancelled.
    pub async fn interrupted(&self) -> TransferError {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => TransferError::Cancelled,
            _ = self.pause.cancelled() => TransferError::Paused,
        }
    }
}

/// Awaits `fut` unless `token` fires first.
pub(crate) async fn or_cancelled<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, TransferError>>,
) -> Result<T, TransferError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TransferError::Cancelled),
        result = fut => result,
    }
}

/// Moves `task` to `next` and announces it.
pub(crate) async fn set_status(
    task: &mut TransferTask,
    next: TransferStatus,
    events: &EventSink,
) -> Result<(), TransferError> {
    task.transition(next)?;
    info!(task = %task.id, key = %task.object_key, status = %next, "transfer status changed");
    events
        .emit(TransferEvent::StatusChanged {
            id: task.id.clone(),
            status: next,
        })
        .await;
    if next == TransferStatus::Completed {
        let target = match task.direction {
            Direction::Upload => task.object_key.clone(),
            Direction::Download => task.local_path.display().to_string(),
        };
        events
            .emit(TransferEvent::Completed {
                id: task.id.clone(),
                target,
            })
            .await;
    }
    Ok(())
}

/// Marks `task` failed with the classification of `err` and announces it.
pub(crate) async fn fail_task(
    task: &mut TransferTask,
    err: &TransferError,
    events: &EventSink,
) -> ClassifiedError {
    let classified = err.classify();
    if let Err(e) = task.fail(classified.clone()) {
        error!(task = %task.id, error = %e, "could not mark task failed");
        return classified;
    }
    error!(
        task = %task.id,
        key = %task.object_key,
        category = %classified.category(),
        retryable = classified.retryable(),
        error = %err,
        "transfer failed"
    );
    events
        .emit(TransferEvent::StatusChanged {
            id: task.id.clone(),
            status: TransferStatus::Failed,
        })
        .await;
    events
        .emit(TransferEvent::Failed {
            id: task.id.clone(),
            error: classified.clone(),
        })
        .await;
    classified
}
