//! Eligibility-ordered task queue.
//!
//! Tasks are keyed by `(eligible_at, id)`. Ids come from the queue's own
//! sequence and are taken under the same lock as the clock reading, so for
//! immediate tasks the key order is exactly submission order, while delayed
//! tasks slot in by eligibility time. The head of the map is always the
//! eligible task that has been waiting longest.
//!
//! Cancelled tasks are not removed eagerly; cancel only flips the task state
//! so that it never touches the queue lock. They are skipped when they reach
//! the head and swept periodically.

use crate::task::{Cancellable, ScheduledTask, TaskBody, TaskState};
use laneway_core::{IdSequence, LaneError, LaneResult, TaskId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sweep cancelled entries after this many pushes
const SWEEP_INTERVAL: u64 = 256;

/// When a task becomes eligible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Relative to the moment of enqueueing
    After(Duration),
    /// Absolute instant; instants already past count as "now"
    At(Instant),
}

impl Deadline {
    /// Eligibility instant relative to `now`
    ///
    /// # Errors
    ///
    /// Returns error if the delay overflows the clock
    pub fn resolve(self, now: Instant) -> LaneResult<Instant> {
        match self {
            Self::After(delay) => now.checked_add(delay).ok_or_else(|| {
                LaneError::invalid_schedule(format!("delay of {delay:?} overflows the clock"))
            }),
            Self::At(at) => Ok(at.max(now)),
        }
    }
}

/// Task queue private to one lane
#[derive(Debug, Default)]
pub(crate) struct LaneQueue {
    entries: BTreeMap<(Instant, TaskId), ScheduledTask>,
    ids: IdSequence,
    pushes: u64,
    discarded: u64,
}

impl LaneQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a task. `eligible_at` is clamped to be no earlier than
    /// `enqueued_at`.
    pub(crate) fn push(
        &mut self,
        enqueued_at: Instant,
        eligible_at: Instant,
        label: Option<String>,
        body: TaskBody,
    ) -> Arc<TaskState> {
        let id = self.ids.next_task();
        let eligible_at = eligible_at.max(enqueued_at);
        let state = Arc::new(TaskState::new());
        self.entries.insert(
            (eligible_at, id),
            ScheduledTask {
                id,
                label,
                enqueued_at,
                eligible_at,
                state: Arc::clone(&state),
                body,
            },
        );

        self.pushes += 1;
        if self.pushes % SWEEP_INTERVAL == 0 {
            self.sweep();
        }
        state
    }

    /// Claim the head task if it is eligible at `now`.
    pub(crate) fn pop_ready(&mut self, now: Instant) -> Option<ScheduledTask> {
        loop {
            let entry = self.entries.first_entry()?;
            if entry.key().0 > now {
                return None;
            }
            let task = entry.remove();
            if task.state.try_dispatch() {
                return Some(task);
            }
            self.discarded += 1;
        }
    }

    /// Eligibility time of the earliest live task
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let entry = self.entries.first_entry()?;
            if entry.get().state.is_pending() {
                return Some(entry.key().0);
            }
            entry.remove();
            self.discarded += 1;
        }
    }

    /// Number of tasks that may still run
    pub(crate) fn live_len(&self) -> usize {
        self.entries.values().filter(|t| t.state.is_pending()).count()
    }

    /// Cancelled tasks dropped without running
    pub(crate) fn discarded(&self) -> u64 {
        self.discarded
    }

    fn sweep(&mut self) {
        let before = self.entries.len();
        self.entries.retain(|_, task| task.state.is_pending());
        self.discarded += (before - self.entries.len()) as u64;
    }
}
