//! Laneway Runtime
//!
//! Named single-threaded execution lanes with delayed and periodic execution,
//! a type-routed message bus, and slow-task instrumentation.
//!
//! Every lane is strictly FIFO among tasks that are eligible at the same
//! time; delayed tasks join in eligibility order. Higher layers
//! ([`RepeatableExecutor`], [`MessageRouter`]) only ever enqueue onto a lane
//! and add no threads or locks of their own to the run loop.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod executor;
pub mod lane;
pub mod manual;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod repeatable;
pub mod router;
pub mod task;

pub use executor::{DelayableExecutor, DelayableExecutorExt, Executor, ExecutorExt};
pub use lane::Lane;
pub use manual::ManualLane;
pub use monitor::{
    FailureReport, LaneObserver, MetricsSnapshot, RecordingObserver, SlowTaskEvent,
    SlowTaskMonitor, TaskTiming, TracingObserver,
};
pub use queue::Deadline;
pub use registry::LaneRegistry;
pub use repeatable::RepeatableExecutor;
pub use router::{MessageRouter, Subscription};
pub use task::{Cancellable, CancellationHandle, TaskBody, TaskState, TaskStatus};
