//! Retry policy with capped exponential backoff.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Classify, ClassifiedError, ErrorCategory, TransferError};

/// Retry configuration.
///
/// Delays grow as `base_delay * backoff_factor^(attempt - 1)` and are capped
/// at `max_delay`. `max_attempts` counts the first attempt too.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Categories eligible for retry. A classified error must also be
    /// retryable on its own to be retried.
    pub retryable_categories: HashSet<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            retryable_categories: HashSet::from([ErrorCategory::Network]),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after the given failed attempt (1-based).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Returns `true` if `err`, raised by attempt number `attempt`, earns
    /// another attempt.
    pub fn should_retry(&self, err: &ClassifiedError, attempt: u32) -> bool {
        err.retryable()
            && self.retryable_categories.contains(&err.category())
            && attempt < self.max_attempts
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.max_attempts == 0 {
            return Err(TransferError::InvalidConfig(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(TransferError::InvalidConfig(format!(
                "retry backoff_factor must be >= 1, got {}",
                self.backoff_factor
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(TransferError::InvalidConfig(format!(
                "retry base_delay {:?} exceeds max_delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RetryBudget
// ---------------------------------------------------------------------------

/// Retry allowance shared by every operation of one task.
#[derive(Debug)]
pub struct RetryBudget {
    max: u32,
    used: AtomicU32,
}

impl RetryBudget {
    pub fn new(max: u32, already_used: u32) -> Self {
        Self {
            max,
            used: AtomicU32::new(already_used.min(max)),
        }
    }

    /// Takes one retry from the budget. Returns `false` once it is spent.
    pub fn try_consume(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.max).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u32 {
        self.max - self.used()
    }
}

// ---------------------------------------------------------------------------
// Retry runner
// ---------------------------------------------------------------------------

/// Runs an operation under a [`RetryPolicy`].
///
/// Optionally stops between attempts on cancellation or pause and draws
/// every retry from a task-wide [`RetryBudget`].
pub struct Retry<'a> {
    policy: &'a RetryPolicy,
    label: &'a str,
    cancel: Option<&'a CancellationToken>,
    pause: Option<&'a CancellationToken>,
    budget: Option<&'a RetryBudget>,
}

impl<'a> Retry<'a> {
    pub fn new(policy: &'a RetryPolicy, label: &'a str) -> Self {
        Self {
            policy,
            label,
            cancel: None,
            pause: None,
            budget: None,
        }
    }

    pub fn cancel_on(mut self, token: &'a CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Returns [`TransferError::Paused`] instead of starting another attempt
    /// once `token` fires. An attempt already running is not interrupted.
    pub fn pause_on(mut self, token: &'a CancellationToken) -> Self {
        self.pause = Some(token);
        self
    }

    pub fn budget(mut self, budget: &'a RetryBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Executes `operation` until it succeeds, fails with an error the policy
    /// will not retry, or runs out of attempts. The last error is returned
    /// unchanged.
    pub async fn run<T, F, Fut>(self, mut operation: F) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut attempt: u32 = 1;

        loop {
            if self.cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(TransferError::Cancelled);
            }
            if self.pause.is_some_and(CancellationToken::is_cancelled) {
                return Err(TransferError::Paused);
            }

            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = self.label, attempts = attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_interruption() => return Err(e),
                Err(e) => e,
            };

            let classified = err.classify();
            if !self.policy.should_retry(&classified, attempt) {
                if classified.retryable() {
                    error!(
                        op = self.label,
                        attempts = attempt,
                        error = %err,
                        "giving up after all retry attempts"
                    );
                } else {
                    warn!(op = self.label, error = %err, category = %classified.category(), "non-retryable failure");
                }
                return Err(err);
            }

            if let Some(budget) = self.budget
                && !budget.try_consume()
            {
                warn!(op = self.label, error = %err, "task retry budget exhausted");
                return Err(err);
            }

            let delay = self.policy.compute_delay(attempt);
            warn!(
                op = self.label,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = fired(self.cancel) => return Err(TransferError::Cancelled),
                _ = fired(self.pause) => return Err(TransferError::Paused),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

/// Resolves when `token` fires; never, without one.
async fn fired(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

/// Runs `operation` with `policy`, logging each attempt under `label`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    operation: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    Retry::new(policy, label).run(operation).await
}
