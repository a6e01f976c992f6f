//! Deterministic lane driven by the caller.
//!
//! [`ManualLane`] queues, orders, times and isolates tasks exactly like
//! [`Lane`](crate::Lane), but owns no thread: tasks run on whichever thread
//! calls one of the `run_*`/`advance_*` methods, and time only moves through
//! its [`ManualClock`]. Only one caller drives the lane at a time; a call made
//! while another is running tasks (from another thread, or from inside a task)
//! runs nothing.

use crate::executor::{DelayableExecutor, Executor, ExecutorExt};
use crate::lane::LaneCore;
use crate::monitor::{LaneObserver, MetricsSnapshot, TracingObserver};
use crate::queue::Deadline;
use crate::task::{CancellationHandle, TaskBody};
use laneway_core::{Clock, LaneResult, ManualClock, SlowTaskThresholds};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Lane whose clock and worker are both in the caller's hands
#[derive(Clone)]
pub struct ManualLane {
    core: Arc<LaneCore>,
    clock: ManualClock,
    driving: Arc<AtomicBool>,
}

/// Clears the driving flag when a drive call ends, also on unwind
struct Driving<'a>(&'a AtomicBool);

impl Drop for Driving<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ManualLane {
    /// Create a manual lane reporting to `observer`
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        thresholds: SlowTaskThresholds,
        observer: Arc<dyn LaneObserver>,
    ) -> Self {
        let clock = ManualClock::new();
        let core = LaneCore::new(name, thresholds, Arc::new(clock.clone()), observer);
        Self {
            core: Arc::new(core),
            clock,
            driving: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a manual lane with reporting disabled
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, SlowTaskThresholds::disabled(), Arc::new(TracingObserver))
    }

    /// The lane's clock; advancing it directly does not run anything
    #[must_use]
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Lane name
    #[must_use]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Append a task to the queue
    pub fn submit<F>(&self, task: F) -> CancellationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(task)
    }

    /// Run every task eligible at the current time, including ones those
    /// tasks queue for "now". Returns how many ran.
    pub fn run_ready(&self) -> usize {
        self.drive(|| self.drain_ready())
    }

    /// Move time forward by `by`, stopping at each deadline on the way so
    /// tasks observe the time they were scheduled for. Returns how many ran.
    pub fn advance_by(&self, by: Duration) -> usize {
        self.drive(|| {
            let target = self.clock.now() + by;
            let mut ran = self.drain_ready();
            while let Some(deadline) = self.core.next_deadline() {
                if deadline > target {
                    break;
                }
                self.clock.advance_to(deadline);
                ran += self.drain_ready();
            }
            self.clock.advance_to(target);
            ran + self.drain_ready()
        })
    }

    /// Jump to the next deadline and run what is eligible there. Returns
    /// `None` when nothing is queued.
    pub fn advance_to_next(&self) -> Option<usize> {
        let deadline = self.core.next_deadline()?;
        Some(self.drive(|| {
            self.clock.advance_to(deadline);
            self.drain_ready()
        }))
    }

    /// Keep advancing until the queue is empty or `max_tasks` have run.
    /// Returns how many ran.
    pub fn run_until_idle(&self, max_tasks: usize) -> usize {
        self.drive(|| {
            let mut ran = self.drain_ready();
            while ran < max_tasks {
                let Some(deadline) = self.core.next_deadline() else {
                    break;
                };
                self.clock.advance_to(deadline);
                ran += self.drain_ready();
            }
            ran
        })
    }

    /// Run `steps` as the lane's only driver, or nothing if another call is
    /// already running tasks
    fn drive(&self, steps: impl FnOnce() -> usize) -> usize {
        if self
            .driving
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            tracing::debug!(lane = self.name(), "lane already being driven");
            return 0;
        }
        let _driving = Driving(&self.driving);
        steps()
    }

    fn drain_ready(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.core.pop_ready() {
            self.core.run(task);
            ran += 1;
        }
        ran
    }

    /// Tasks still waiting to run
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.core.pending_count()
    }

    /// Counters for this lane
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics()
    }
}

impl Executor for ManualLane {
    fn enqueue(&self, label: Option<String>, body: TaskBody) -> CancellationHandle {
        self.core.enqueue(label, body)
    }
}

impl DelayableExecutor for ManualLane {
    fn lane_name(&self) -> &str {
        self.core.name()
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn enqueue_at(
        &self,
        label: Option<String>,
        body: TaskBody,
        deadline: Deadline,
    ) -> LaneResult<CancellationHandle> {
        self.core.enqueue_at(label, body, deadline)
    }
}

impl std::fmt::Debug for ManualLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualLane")
            .field("name", &self.name())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DelayableExecutorExt;
    use crate::monitor::RecordingObserver;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> impl FnOnce() + Send + 'static {
        move || log.lock().unwrap().push(label)
    }

    #[test]
    fn test_nothing_runs_until_driven() {
        let lane = ManualLane::named("m");
        let log = recorder();
        lane.submit(push(log.clone(), "a"));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(lane.pending_count(), 1);
        assert_eq!(lane.run_ready(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_delayed_needs_time() {
        let lane = ManualLane::named("m");
        let log = recorder();
        lane.execute_delayed(push(log.clone(), "d"), Duration::from_millis(100)).unwrap();
        assert_eq!(lane.run_ready(), 0);
        assert_eq!(lane.advance_by(Duration::from_millis(99)), 0);
        assert_eq!(lane.advance_by(Duration::from_millis(1)), 1);
        assert_eq!(*log.lock().unwrap(), vec!["d"]);
    }

    #[test]
    fn test_zero_delay_same_as_execute() {
        let lane = ManualLane::named("m");
        let log = recorder();
        lane.submit(push(log.clone(), "a"));
        lane.execute_delayed(push(log.clone(), "b"), Duration::ZERO).unwrap();
        lane.submit(push(log.clone(), "c"));
        lane.run_ready();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_past_absolute_time_runs_now() {
        let lane = ManualLane::named("m");
        let log = recorder();
        let past = lane.now();
        lane.clock().advance(Duration::from_secs(1));
        lane.submit(push(log.clone(), "first"));
        lane.execute_at_time(push(log.clone(), "past"), past).unwrap();
        assert_eq!(lane.run_ready(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "past"]);
    }

    #[test]
    fn test_absolute_time_in_future() {
        let lane = ManualLane::named("m");
        let log = recorder();
        let at = lane.now() + Duration::from_millis(250);
        lane.execute_at_time(push(log.clone(), "at"), at).unwrap();
        assert_eq!(lane.advance_to_next(), Some(1));
        assert_eq!(lane.now(), at);
        assert_eq!(lane.advance_to_next(), None);
    }

    #[test]
    fn test_advance_observes_deadlines_in_order() {
        let lane = ManualLane::named("m");
        let times = Arc::new(Mutex::new(Vec::new()));
        let start = lane.now();
        for ms in [300_u64, 100, 200] {
            let times = times.clone();
            let probe = lane.clone();
            lane.execute_delayed(
                move || times.lock().unwrap().push(probe.now() - start),
                Duration::from_millis(ms),
            )
            .unwrap();
        }
        assert_eq!(lane.advance_by(Duration::from_secs(1)), 3);
        assert_eq!(
            *times.lock().unwrap(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
        assert_eq!(lane.now() - start, Duration::from_secs(1));
    }

    #[test]
    fn test_cancel_prevents_run() {
        let lane = ManualLane::named("m");
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = lane
            .execute_delayed(move || flag.store(true, Ordering::SeqCst), Duration::from_millis(10))
            .unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        lane.advance_by(Duration::from_millis(50));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(lane.metrics().cancelled, 1);
    }

    #[test]
    fn test_task_can_enqueue_more_work() {
        let lane = ManualLane::named("m");
        let count = Arc::new(AtomicUsize::new(0));
        let inner_lane = lane.clone();
        let c = count.clone();
        lane.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c = c.clone();
            inner_lane.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        });
        assert_eq!(lane.run_ready(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failure_isolated() {
        let observer = Arc::new(RecordingObserver::new());
        let lane = ManualLane::new("m", SlowTaskThresholds::disabled(), observer.clone());
        let flag = Arc::new(AtomicBool::new(false));
        lane.execute_labeled("a", || panic!("a failed"));
        let b = flag.clone();
        lane.execute_labeled("b", move || b.store(true, Ordering::SeqCst));
        assert_eq!(lane.run_ready(), 2);
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(observer.failures().len(), 1);
        assert_eq!(observer.failures()[0].label, "a");
    }

    #[test]
    fn test_slow_delivery_on_manual_time() {
        let observer = Arc::new(RecordingObserver::new());
        let lane = ManualLane::new("m", SlowTaskThresholds::from_millis(1000, 100), observer.clone());
        let clock = lane.clock().clone();
        lane.execute_labeled("fast", {
            let clock = clock.clone();
            move || clock.advance(Duration::from_millis(5))
        });
        lane.execute_labeled("slow", move || clock.advance(Duration::from_millis(150)));
        lane.run_ready();

        let events = observer.slow_tasks();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label, "slow");
        assert!(events[0].slow_delivery);
        assert_eq!(events[0].delivery_latency, Duration::from_millis(150));
    }

    #[test]
    fn test_slow_dispatch_on_manual_time() {
        let observer = Arc::new(RecordingObserver::new());
        let lane = ManualLane::new("m", SlowTaskThresholds::from_millis(1000, 5000), observer.clone());
        let clock = lane.clock().clone();
        lane.execute_labeled("hog", move || clock.advance(Duration::from_millis(1500)));
        lane.execute_labeled("victim", || {});
        lane.run_ready();

        let events = observer.slow_tasks();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].label, "victim");
        assert!(events[0].dispatch_latency >= Duration::from_millis(1000));
    }

    #[test]
    fn test_run_until_idle_bounded() {
        let lane = ManualLane::named("m");
        for ms in 1..=5 {
            lane.execute_delayed(|| {}, Duration::from_millis(ms)).unwrap();
        }
        assert_eq!(lane.run_until_idle(100), 5);
        assert_eq!(lane.pending_count(), 0);
    }

    #[test]
    fn test_drive_from_inside_task_runs_nothing() {
        let lane = ManualLane::named("m");
        let log = recorder();
        let nested = Arc::new(Mutex::new(None));
        let inner = lane.clone();
        let (l, n) = (log.clone(), nested.clone());
        lane.submit(move || {
            l.lock().unwrap().push("a");
            *n.lock().unwrap() = Some((inner.run_ready(), inner.run_until_idle(10)));
        });
        lane.submit(push(log.clone(), "b"));

        assert_eq!(lane.run_ready(), 2);
        assert_eq!(*nested.lock().unwrap(), Some((0, 0)));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_concurrent_drivers_never_overlap() {
        let lane = ManualLane::named("m");
        let busy = Arc::new(AtomicBool::new(false));
        let overlap = Arc::new(AtomicBool::new(false));
        for _ in 0..200 {
            let (busy, overlap) = (busy.clone(), overlap.clone());
            lane.submit(move || {
                if busy.swap(true, Ordering::SeqCst) {
                    overlap.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_micros(50));
                busy.store(false, Ordering::SeqCst);
            });
        }

        let ran = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    while lane.pending_count() > 0 {
                        ran.fetch_add(lane.run_ready(), Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(ran.load(Ordering::SeqCst), 200);
        assert!(!overlap.load(Ordering::SeqCst));
    }

    proptest! {
        #[test]
        fn prop_dispatch_follows_eligibility(delays in proptest::collection::vec(0u64..1000, 1..32)) {
            let lane = ManualLane::named("m");
            let start = lane.now();
            let seen = Arc::new(Mutex::new(Vec::new()));
            for d in &delays {
                let seen = seen.clone();
                let probe = lane.clone();
                lane.execute_delayed(
                    move || seen.lock().unwrap().push(probe.now() - start),
                    Duration::from_millis(*d),
                ).unwrap();
            }
            lane.advance_by(Duration::from_millis(1000));
            let seen = seen.lock().unwrap().clone();
            let mut expected: Vec<_> = delays.iter().map(|d| Duration::from_millis(*d)).collect();
            expected.sort();
            prop_assert_eq!(seen, expected);
        }
    }
}
