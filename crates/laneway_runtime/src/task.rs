//! Tasks and cancellation.
//!
//! A task moves through one atomic state field:
//! `Pending -> Dispatched -> Completed` or `Pending -> Cancelled`.
//! Dispatch and cancel both compare-and-set out of `Pending`, so whichever
//! lands first wins and the loser becomes a no-op.

use crate::monitor::{SlowTaskMonitor, TaskTiming};
use laneway_core::{Clock, TaskFailure, TaskId};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// Body of a queued task
pub type TaskBody = Box<dyn FnOnce() -> Result<(), TaskFailure> + Send + 'static>;

/// Lifecycle of a queued task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Waiting in the queue
    Pending = 0,
    /// Claimed by the worker and running
    Dispatched = 1,
    /// Finished running (successfully or not)
    Completed = 2,
    /// Cancelled before dispatch
    Cancelled = 3,
}

impl TaskStatus {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Dispatched,
            2 => Self::Completed,
            _ => Self::Cancelled,
        }
    }
}

/// Shared state of one task
#[derive(Debug)]
pub struct TaskState(AtomicU8);

impl TaskState {
    /// New pending state
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(TaskStatus::Pending as u8))
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the task for running. Fails if it was cancelled.
    pub(crate) fn try_dispatch(&self) -> bool {
        self.transition(TaskStatus::Pending, TaskStatus::Dispatched)
    }

    pub(crate) fn complete(&self) {
        self.transition(TaskStatus::Dispatched, TaskStatus::Completed);
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything a [`CancellationHandle`] can stop
pub trait Cancellable: Send + Sync {
    /// Prevent any execution that has not started yet.
    ///
    /// Returns `true` only if this call stopped something; repeated or late
    /// calls return `false` and change nothing.
    fn cancel(&self) -> bool;

    /// Whether cancel has taken effect
    fn is_cancelled(&self) -> bool;

    /// Whether a future execution may still happen
    fn is_pending(&self) -> bool;
}

impl Cancellable for TaskState {
    fn cancel(&self) -> bool {
        self.transition(TaskStatus::Pending, TaskStatus::Cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.status() == TaskStatus::Cancelled
    }

    fn is_pending(&self) -> bool {
        self.status() == TaskStatus::Pending
    }
}

/// Handle returned by every scheduling call.
///
/// Cloning is cheap and all clones control the same work. Cancel is safe from
/// any thread, any number of times.
#[derive(Clone)]
pub struct CancellationHandle {
    inner: Arc<dyn Cancellable>,
}

impl CancellationHandle {
    /// Wrap a cancellable
    #[must_use]
    pub fn new(inner: Arc<dyn Cancellable>) -> Self {
        Self { inner }
    }

    /// Cancel; see [`Cancellable::cancel`]
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Whether cancel has taken effect
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Whether a future execution may still happen
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.is_pending()
    }
}

impl fmt::Debug for CancellationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationHandle")
            .field("cancelled", &self.is_cancelled())
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// A task owned by a lane queue
pub(crate) struct ScheduledTask {
    pub(crate) id: TaskId,
    pub(crate) label: Option<String>,
    pub(crate) enqueued_at: Instant,
    pub(crate) eligible_at: Instant,
    pub(crate) state: Arc<TaskState>,
    pub(crate) body: TaskBody,
}

impl ScheduledTask {
    pub(crate) fn label(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.id.to_string())
    }

    /// Run a dispatched task to completion, isolating panics, and feed its
    /// timings to the monitor.
    pub(crate) fn run(self, clock: &dyn Clock, monitor: &SlowTaskMonitor) {
        let label = self.label();
        let dispatched_at = clock.now();
        monitor.record_dispatch();
        tracing::trace!(lane = monitor.lane(), label = %label, "dispatch");

        let outcome = panic::catch_unwind(AssertUnwindSafe(self.body))
            .unwrap_or_else(|payload| Err(TaskFailure::from_panic(payload.as_ref())));

        let delivered_at = clock.now();
        self.state.complete();

        let timing = TaskTiming {
            enqueued_at: self.enqueued_at,
            eligible_at: self.eligible_at,
            dispatched_at,
            delivered_at,
        };
        monitor.record(&label, &timing, outcome.as_ref().err());
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("eligible_at", &self.eligible_at)
            .field("status", &self.state.status())
            .finish()
    }
}
