//! Slow-task instrumentation and lane metrics.
//!
//! Every task run on a lane is timed. The monitor compares the timings with
//! the lane's thresholds and tells the [`LaneObserver`] about slow tasks and
//! failures. Nothing here feeds back into scheduling.

use laneway_core::{duration_millis, SlowTaskThresholds, TaskFailure};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Timestamps of one task run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTiming {
    /// When the task was submitted
    pub enqueued_at: Instant,
    /// Earliest instant it was allowed to run
    pub eligible_at: Instant,
    /// When the worker started it
    pub dispatched_at: Instant,
    /// When it finished
    pub delivered_at: Instant,
}

impl TaskTiming {
    /// Time spent waiting after becoming eligible.
    ///
    /// A deliberate delay is not counted, so this is measured from the later
    /// of enqueue and eligibility.
    #[must_use]
    pub fn dispatch_latency(&self) -> Duration {
        let ready_at = self.enqueued_at.max(self.eligible_at);
        self.dispatched_at.saturating_duration_since(ready_at)
    }

    /// Time spent running
    #[must_use]
    pub fn delivery_latency(&self) -> Duration {
        self.delivered_at.saturating_duration_since(self.dispatched_at)
    }
}

/// A task that crossed a threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowTaskEvent {
    /// Lane name
    pub lane: String,
    /// Task label
    pub label: String,
    /// Wait between eligibility and start
    pub dispatch_latency: Duration,
    /// Run time
    pub delivery_latency: Duration,
    /// Dispatch threshold exceeded
    pub slow_dispatch: bool,
    /// Delivery threshold exceeded
    pub slow_delivery: bool,
}

/// External collaborator receiving lane diagnostics
pub trait LaneObserver: Send + Sync {
    /// A task exceeded a slow-task threshold
    fn report_slow_task(&self, event: &SlowTaskEvent);

    /// A task body failed; the lane carried on
    fn report_task_failure(&self, lane: &str, label: &str, failure: &TaskFailure);
}

/// Observer that logs through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl LaneObserver for TracingObserver {
    fn report_slow_task(&self, event: &SlowTaskEvent) {
        tracing::warn!(
            lane = %event.lane,
            label = %event.label,
            dispatch_ms = duration_millis(event.dispatch_latency),
            delivery_ms = duration_millis(event.delivery_latency),
            slow_dispatch = event.slow_dispatch,
            slow_delivery = event.slow_delivery,
            "slow task"
        );
    }

    fn report_task_failure(&self, lane: &str, label: &str, failure: &TaskFailure) {
        tracing::error!(lane, label, error = %failure, "task failed");
    }
}

/// A failure captured by [`RecordingObserver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Lane name
    pub lane: String,
    /// Task label
    pub label: String,
    /// What went wrong
    pub failure: TaskFailure,
}

/// Observer that keeps every report in memory
#[derive(Debug, Default)]
pub struct RecordingObserver {
    slow: Mutex<Vec<SlowTaskEvent>>,
    failures: Mutex<Vec<FailureReport>>,
}

impl RecordingObserver {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Slow-task events so far
    #[must_use]
    pub fn slow_tasks(&self) -> Vec<SlowTaskEvent> {
        self.slow.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Failures so far
    #[must_use]
    pub fn failures(&self) -> Vec<FailureReport> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LaneObserver for RecordingObserver {
    fn report_slow_task(&self, event: &SlowTaskEvent) {
        self.slow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }

    fn report_task_failure(&self, lane: &str, label: &str, failure: &TaskFailure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FailureReport {
                lane: lane.to_string(),
                label: label.to_string(),
                failure: failure.clone(),
            });
    }
}

/// Point-in-time copy of lane counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Tasks started
    pub dispatched: u64,
    /// Tasks finished (including failed ones)
    pub delivered: u64,
    /// Tasks whose body failed
    pub failed: u64,
    /// Cancelled tasks dropped from the queue
    pub cancelled: u64,
    /// Tasks over the dispatch threshold
    pub slow_dispatch: u64,
    /// Tasks over the delivery threshold
    pub slow_delivery: u64,
}

impl MetricsSnapshot {
    /// Failed fraction of delivered tasks (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.delivered == 0 {
            return 0.0;
        }
        self.failed as f64 / self.delivered as f64
    }
}

/// Lane counters
#[derive(Debug, Default)]
pub struct LaneMetrics {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    slow_dispatch: AtomicU64,
    slow_delivery: AtomicU64,
}

impl LaneMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters; `cancelled` comes from the queue
    #[must_use]
    pub fn snapshot(&self, cancelled: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled,
            slow_dispatch: self.slow_dispatch.load(Ordering::Relaxed),
            slow_delivery: self.slow_delivery.load(Ordering::Relaxed),
        }
    }
}

/// Per-lane instrumentation
pub struct SlowTaskMonitor {
    lane: String,
    thresholds: SlowTaskThresholds,
    metrics: LaneMetrics,
    observer: Arc<dyn LaneObserver>,
}

impl SlowTaskMonitor {
    /// Create a monitor for one lane
    #[must_use]
    pub fn new(
        lane: impl Into<String>,
        thresholds: SlowTaskThresholds,
        observer: Arc<dyn LaneObserver>,
    ) -> Self {
        Self {
            lane: lane.into(),
            thresholds,
            metrics: LaneMetrics::default(),
            observer,
        }
    }

    /// Lane name
    #[must_use]
    pub fn lane(&self) -> &str {
        &self.lane
    }

    /// Configured thresholds
    #[must_use]
    pub const fn thresholds(&self) -> SlowTaskThresholds {
        self.thresholds
    }

    /// Counters
    #[must_use]
    pub fn metrics(&self) -> &LaneMetrics {
        &self.metrics
    }

    /// Compare timings with the thresholds. Strictly greater is slow.
    #[must_use]
    pub fn evaluate(&self, label: &str, timing: &TaskTiming) -> Option<SlowTaskEvent> {
        let dispatch_latency = timing.dispatch_latency();
        let delivery_latency = timing.delivery_latency();
        let slow_dispatch = self
            .thresholds
            .dispatch()
            .is_some_and(|limit| dispatch_latency > limit);
        let slow_delivery = self
            .thresholds
            .delivery()
            .is_some_and(|limit| delivery_latency > limit);

        (slow_dispatch || slow_delivery).then(|| SlowTaskEvent {
            lane: self.lane.clone(),
            label: label.to_string(),
            dispatch_latency,
            delivery_latency,
            slow_dispatch,
            slow_delivery,
        })
    }

    /// Account for a task the worker has just claimed
    pub fn record_dispatch(&self) {
        LaneMetrics::bump(&self.metrics.dispatched);
    }

    /// Account for one finished task
    pub fn record(&self, label: &str, timing: &TaskTiming, failure: Option<&TaskFailure>) {
        LaneMetrics::bump(&self.metrics.delivered);

        if let Some(failure) = failure {
            LaneMetrics::bump(&self.metrics.failed);
            self.notify(label, || self.observer.report_task_failure(&self.lane, label, failure));
        }

        if let Some(event) = self.evaluate(label, timing) {
            if event.slow_dispatch {
                LaneMetrics::bump(&self.metrics.slow_dispatch);
            }
            if event.slow_delivery {
                LaneMetrics::bump(&self.metrics.slow_delivery);
            }
            self.notify(label, || self.observer.report_slow_task(&event));
        }
    }

    /// Observer panics are contained here so they never unwind the worker.
    fn notify(&self, label: &str, report: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(report)) {
            let failure = TaskFailure::from_panic(payload.as_ref());
            tracing::error!(
                lane = %self.lane,
                label = %label,
                error = %failure,
                "lane observer panicked"
            );
        }
    }
}

impl std::fmt::Debug for SlowTaskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlowTaskMonitor")
            .field("lane", &self.lane)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}
