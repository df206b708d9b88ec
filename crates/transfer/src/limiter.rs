//! Counting admission gate for part transfers.
//!
//! Waiters are served strictly in arrival order. A released permit goes
//! straight to the oldest waiter instead of returning to the pool, so a
//! newcomer can never overtake someone already queued.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

/// Shared permit pool. Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    permits: usize,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    available: usize,
    next_ticket: u64,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hands the permit to the oldest live waiter, or returns it to the pool.
    fn release(&self) {
        let mut state = self.lock();
        while let Some((_, tx)) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        state.available += 1;
    }
}

/// A held permit. Dropping it releases the permit.
pub struct LimiterPermit {
    inner: Arc<Inner>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// Queue slot of a caller waiting in [`ConcurrencyLimiter::acquire`].
///
/// If the caller goes away while queued, the slot is removed; if the permit
/// had already been handed over, it is passed on to the next waiter.
struct QueuedWaiter {
    inner: Arc<Inner>,
    ticket: u64,
    done: bool,
}

impl Drop for QueuedWaiter {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.inner.lock();
        if let Some(pos) = state.waiters.iter().position(|(t, _)| *t == self.ticket) {
            state.waiters.remove(pos);
            return;
        }
        drop(state);
        self.inner.release();
    }
}

impl ConcurrencyLimiter {
    /// Creates a limiter with `permits` concurrent holders (at least one).
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            inner: Arc::new(Inner {
                permits,
                state: Mutex::new(LimiterState {
                    available: permits,
                    next_ticket: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Waits for a permit.
    pub async fn acquire(&self) -> LimiterPermit {
        let (ticket, rx) = {
            let mut state = self.inner.lock();
            if state.available > 0 && state.waiters.is_empty() {
                state.available -= 1;
                return LimiterPermit {
                    inner: Arc::clone(&self.inner),
                };
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back((ticket, tx));
            (ticket, rx)
        };

        let mut waiter = QueuedWaiter {
            inner: Arc::clone(&self.inner),
            ticket,
            done: false,
        };
        // The sender is only dropped after a successful hand-off or by the
        // waiter's own cleanup, so `Err` cannot be observed here.
        let _ = rx.await;
        waiter.done = true;

        LimiterPermit {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns a permit if one is free and nobody is queued.
    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        let mut state = self.inner.lock();
        if state.available > 0 && state.waiters.is_empty() {
            state.available -= 1;
            Some(LimiterPermit {
                inner: Arc::clone(&self.inner),
            })
        } else {
            None
        }
    }

    /// Runs `task` while holding a permit.
    pub async fn run<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        task().await
    }

    /// Configured number of concurrent holders.
    pub fn permits(&self) -> usize {
        self.inner.permits
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.inner.lock().available
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.inner.permits - self.available()
    }

    /// Callers waiting for a permit.
    pub fn queued(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("permits", &self.inner.permits)
            .field("available", &self.available())
            .field("queued", &self.queued())
            .finish()
    }
}
