//! Kernel abstraction layer: blocking waits for the connection core.
//!
//! The net crate cannot depend on the scheduler directly.  The kernel
//! registers a [`KalHooks`] implementation at boot; until then (and in unit
//! tests) every wait degrades to a non-blocking poll.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::NetError;

// ============================================================================
// Wait Outcome
// ============================================================================

/// Result of a blocking wait on a [`WaitQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Explicitly woken by `wake_one`/`wake_all`
    Woken,
    /// Timeout expired (or the wait was a poll)
    TimedOut,
    /// Queue was closed while waiting
    Closed,
    /// Called without a task context
    NoProcess,
}

impl From<WaitOutcome> for Result<(), NetError> {
    fn from(outcome: WaitOutcome) -> Self {
        match outcome {
            WaitOutcome::Woken => Ok(()),
            WaitOutcome::TimedOut => Err(NetError::Timeout),
            WaitOutcome::Closed => Err(NetError::ConnClosed),
            WaitOutcome::NoProcess => Err(NetError::WouldBlock),
        }
    }
}

// ============================================================================
// Scheduler Hooks
// ============================================================================

/// Scheduler integration registered by the kernel.
///
/// Implementations must not hold the network stack lock across a
/// reschedule; callers of [`WaitQueue::wait_with_timeout`] release it first.
pub trait KalHooks: Send + Sync {
    /// Block the current task on `queue`.
    ///
    /// `timeout_ms`: `None` blocks indefinitely, `Some(n)` for up to n ms.
    fn wait(&self, queue: &WaitQueue, timeout_ms: Option<u64>) -> WaitOutcome;

    /// Wake the longest-waiting task blocked on `queue`.
    fn wake_one(&self, queue: &WaitQueue);

    /// Wake every task blocked on `queue`.
    fn wake_all(&self, queue: &WaitQueue);
}

static KAL_HOOKS: spin::Once<&'static dyn KalHooks> = spin::Once::new();

/// Register the scheduler hooks.  Only the first registration takes effect.
pub fn register_kal_hooks(hooks: &'static dyn KalHooks) {
    KAL_HOOKS.call_once(|| hooks);
}

#[inline]
fn kal_hooks() -> Option<&'static dyn KalHooks> {
    KAL_HOOKS.get().copied()
}

// ============================================================================
// Wait Queue
// ============================================================================

/// Semaphore-like wait queue.
///
/// A wake with no blocked waiter is remembered in `wakeup_count` so the next
/// wait returns immediately instead of missing the signal.
pub struct WaitQueue {
    closed: AtomicBool,
    wakeup_count: AtomicU64,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue {
            closed: AtomicBool::new(false),
            wakeup_count: AtomicU64::new(0),
        }
    }

    /// Wait for a signal.
    ///
    /// `Some(0)` polls.  Without registered hooks a wait that finds no
    /// pending signal reports `TimedOut`.
    pub fn wait_with_timeout(&self, timeout_ms: Option<u64>) -> WaitOutcome {
        if self.closed.load(Ordering::Acquire) {
            return WaitOutcome::Closed;
        }

        if self
            .wakeup_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then(|| current - 1)
            })
            .is_ok()
        {
            return WaitOutcome::Woken;
        }

        if timeout_ms == Some(0) {
            return WaitOutcome::TimedOut;
        }

        match kal_hooks() {
            Some(hooks) => hooks.wait(self, timeout_ms),
            None => WaitOutcome::TimedOut,
        }
    }

    /// Signal one waiter.
    pub fn wake_one(&self) {
        self.wakeup_count.fetch_add(1, Ordering::Release);
        if let Some(hooks) = kal_hooks() {
            hooks.wake_one(self);
        }
    }

    /// Signal all waiters.
    pub fn wake_all(&self) {
        self.wakeup_count.fetch_add(1, Ordering::Release);
        if let Some(hooks) = kal_hooks() {
            hooks.wake_all(self);
        }
    }

    /// Drop any remembered signals.
    pub fn clear(&self) {
        self.wakeup_count.store(0, Ordering::Release);
    }

    /// Close the queue; current and future waiters see `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(hooks) = kal_hooks() {
            hooks.wake_all(self);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
