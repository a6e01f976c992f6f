//! Executor traits.
//!
//! [`Executor`] and [`DelayableExecutor`] are the object-safe seams every lane
//! implements; the closure-friendly methods callers actually use live in the
//! blanket [`ExecutorExt`] and [`DelayableExecutorExt`] traits.

use crate::queue::Deadline;
use crate::task::{CancellationHandle, TaskBody};
use laneway_core::{LaneResult, TaskFailure};
use std::fmt::Display;
use std::time::{Duration, Instant};

/// Runs tasks in submission order
pub trait Executor: Send + Sync {
    /// Queue a task to run as soon as everything ahead of it has run
    fn enqueue(&self, label: Option<String>, body: TaskBody) -> CancellationHandle;
}

/// An [`Executor`] that can also hold tasks back until a deadline
pub trait DelayableExecutor: Executor {
    /// Name of the lane that runs the tasks
    fn lane_name(&self) -> &str;

    /// The lane's notion of now
    fn now(&self) -> Instant;

    /// Queue a task that becomes eligible at `deadline`
    ///
    /// # Errors
    ///
    /// Returns error if the deadline cannot be represented
    fn enqueue_at(
        &self,
        label: Option<String>,
        body: TaskBody,
        deadline: Deadline,
    ) -> LaneResult<CancellationHandle>;
}

fn infallible<F>(task: F) -> TaskBody
where
    F: FnOnce() + Send + 'static,
{
    Box::new(move || {
        task();
        Ok(())
    })
}

fn fallible<F, E>(task: F) -> TaskBody
where
    F: FnOnce() -> Result<(), E> + Send + 'static,
    E: Display,
{
    Box::new(move || task().map_err(|e| TaskFailure::new(e.to_string())))
}

/// Closure helpers for any [`Executor`]
pub trait ExecutorExt: Executor {
    /// Run `task` after everything already queued
    fn execute<F>(&self, task: F) -> CancellationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(None, infallible(task))
    }

    /// As [`ExecutorExt::execute`], with a label for diagnostics
    fn execute_labeled<F>(&self, label: impl Into<String>, task: F) -> CancellationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Some(label.into()), infallible(task))
    }

    /// Run a task whose `Err` is reported as a task failure
    fn execute_fallible<F, E>(&self, label: impl Into<String>, task: F) -> CancellationHandle
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Display,
    {
        self.enqueue(Some(label.into()), fallible(task))
    }
}

impl<T: Executor + ?Sized> ExecutorExt for T {}

/// Closure helpers for any [`DelayableExecutor`]
pub trait DelayableExecutorExt: DelayableExecutor {
    /// Run `task` once `delay` has elapsed. A zero delay behaves like
    /// [`ExecutorExt::execute`].
    ///
    /// # Errors
    ///
    /// Returns error if the delay overflows the clock
    fn execute_delayed<F>(&self, task: F, delay: Duration) -> LaneResult<CancellationHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue_at(None, infallible(task), Deadline::After(delay))
    }

    /// Run `task` at `at`; a time already past runs as soon as possible
    ///
    /// # Errors
    ///
    /// Currently never fails; kept fallible to match `execute_delayed`
    fn execute_at_time<F>(&self, task: F, at: Instant) -> LaneResult<CancellationHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue_at(None, infallible(task), Deadline::At(at))
    }

    /// Labelled form of [`DelayableExecutorExt::execute_delayed`]
    ///
    /// # Errors
    ///
    /// Returns error if the delay overflows the clock
    fn execute_delayed_labeled<F>(
        &self,
        label: impl Into<String>,
        task: F,
        delay: Duration,
    ) -> LaneResult<CancellationHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue_at(Some(label.into()), infallible(task), Deadline::After(delay))
    }
}

impl<T: DelayableExecutor + ?Sized> DelayableExecutorExt for T {}
