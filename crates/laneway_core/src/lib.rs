//! Laneway Core Types
//!
//! Pure types shared by every lane: errors, ids, clocks and configuration.
//! Nothing in this crate spawns threads or runs tasks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod id;
pub mod time;

// Re-exports
pub use config::{LaneConfig, LaneSetConfig, SlowTaskThresholds};
pub use error::{LaneError, LaneResult, TaskFailure};
pub use id::{IdSequence, SubscriptionId, TaskId};
pub use time::{duration_millis, Clock, ManualClock, MonotonicClock};
