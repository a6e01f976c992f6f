//! Periodic execution layered on a [`DelayableExecutor`].
//!
//! A series schedules one occurrence at a time. When an occurrence finishes
//! (or fails) it schedules its successor at `origin + n * interval`, so the
//! cadence never drifts with task run time. An occurrence that overran its
//! slot leaves a successor that is already due; it runs immediately and the
//! series catches up rather than skipping slots.

use crate::executor::DelayableExecutor;
use crate::queue::Deadline;
use crate::task::{Cancellable, CancellationHandle, TaskBody};
use laneway_core::{LaneError, LaneResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

type RepeatingTask = Box<dyn Fn() + Send + Sync + 'static>;

/// Runs a task at a fixed cadence on one lane
#[derive(Clone)]
pub struct RepeatableExecutor {
    executor: Arc<dyn DelayableExecutor>,
}

impl RepeatableExecutor {
    /// Wrap a delayable executor
    #[must_use]
    pub fn new(executor: Arc<dyn DelayableExecutor>) -> Self {
        Self { executor }
    }

    /// Name of the underlying lane
    #[must_use]
    pub fn lane_name(&self) -> &str {
        self.executor.lane_name()
    }

    /// Run `task` every `interval`. The first occurrence runs right away when
    /// `start_immediately` is set, otherwise one interval from now.
    ///
    /// The returned handle stops the whole series. An occurrence already
    /// running finishes, but nothing is scheduled after it.
    ///
    /// # Errors
    ///
    /// Returns error if `interval` is zero
    pub fn execute_repeatedly<F>(
        &self,
        task: F,
        interval: Duration,
        start_immediately: bool,
    ) -> LaneResult<CancellationHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.start(None, Box::new(task), interval, start_immediately)
    }

    /// Labelled form of [`RepeatableExecutor::execute_repeatedly`]
    ///
    /// # Errors
    ///
    /// Returns error if `interval` is zero
    pub fn execute_repeatedly_labeled<F>(
        &self,
        label: impl Into<String>,
        task: F,
        interval: Duration,
        start_immediately: bool,
    ) -> LaneResult<CancellationHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.start(Some(label.into()), Box::new(task), interval, start_immediately)
    }

    fn start(
        &self,
        label: Option<String>,
        task: RepeatingTask,
        interval: Duration,
        start_immediately: bool,
    ) -> LaneResult<CancellationHandle> {
        if interval.is_zero() {
            return Err(LaneError::invalid_schedule("repeat interval must be positive"));
        }

        let series = Arc::new(Series {
            executor: Arc::clone(&self.executor),
            label,
            task,
            origin: self.executor.now(),
            interval,
            cancelled: AtomicBool::new(false),
            occurrences: AtomicU64::new(0),
            next: Mutex::new(None),
        });

        Series::schedule(&series, u64::from(!start_immediately))?;
        Ok(CancellationHandle::new(series))
    }
}

impl std::fmt::Debug for RepeatableExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatableExecutor")
            .field("lane", &self.lane_name())
            .finish()
    }
}

/// Shared state of one repeating series
struct Series {
    executor: Arc<dyn DelayableExecutor>,
    label: Option<String>,
    task: RepeatingTask,
    origin: Instant,
    interval: Duration,
    cancelled: AtomicBool,
    occurrences: AtomicU64,
    /// Handle of the queued occurrence. Scheduling and cancelling both hold
    /// this lock, so a cancel can never miss a freshly queued successor.
    next: Mutex<Option<CancellationHandle>>,
}

impl Series {
    /// Eligibility time of occurrence `n`
    fn occurrence_time(&self, n: u64) -> LaneResult<Instant> {
        let overflow = || LaneError::invalid_schedule("repeating series ran past the clock range");
        let nanos = self
            .interval
            .as_nanos()
            .checked_mul(u128::from(n))
            .and_then(|total| u64::try_from(total).ok())
            .ok_or_else(overflow)?;
        self.origin
            .checked_add(Duration::from_nanos(nanos))
            .ok_or_else(overflow)
    }

    /// Queue occurrence `n` unless the series was cancelled
    fn schedule(series: &Arc<Self>, n: u64) -> LaneResult<()> {
        let mut next = series.next.lock().unwrap_or_else(PoisonError::into_inner);
        if series.cancelled.load(Ordering::Acquire) {
            return Ok(());
        }

        let at = series.occurrence_time(n)?;
        let this = Arc::clone(series);
        let body: TaskBody = Box::new(move || {
            this.run_occurrence(n);
            Ok(())
        });
        let handle = series
            .executor
            .enqueue_at(series.label.clone(), body, Deadline::At(at))?;
        *next = Some(handle);
        Ok(())
    }

    fn run_occurrence(self: &Arc<Self>, n: u64) {
        // Reschedules on the way out, also when the task panics.
        let _successor = Successor { series: self, n: n + 1 };
        self.occurrences.fetch_add(1, Ordering::Relaxed);
        (self.task)();
    }
}

impl Cancellable for Series {
    fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let queued = self
            .next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = queued {
            handle.cancel();
        }
        tracing::debug!(
            lane = self.executor.lane_name(),
            occurrences = self.occurrences.load(Ordering::Relaxed),
            "repeating series cancelled"
        );
        true
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn is_pending(&self) -> bool {
        !self.is_cancelled()
    }
}

/// Drop guard that queues the next occurrence
struct Successor<'a> {
    series: &'a Arc<Series>,
    n: u64,
}

impl Drop for Successor<'_> {
    fn drop(&mut self) {
        if let Err(err) = Series::schedule(self.series, self.n) {
            self.series.cancelled.store(true, Ordering::Release);
            tracing::error!(
                lane = self.series.executor.lane_name(),
                error = %err,
                "repeating series stopped"
            );
        }
    }
}
