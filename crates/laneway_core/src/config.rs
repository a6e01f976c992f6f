//! Lane configuration.
//!
//! A [`LaneSetConfig`] lists every lane a process starts with. Thresholds are
//! fixed when a lane is created and never change afterwards.

use crate::error::{LaneError, LaneResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Slow-task thresholds for one lane.
///
/// A threshold of zero disables that check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SlowTaskThresholds {
    /// Maximum time a task may wait between becoming eligible and starting
    #[serde(default)]
    pub dispatch_ms: u64,
    /// Maximum time a task may run
    #[serde(default)]
    pub delivery_ms: u64,
}

impl SlowTaskThresholds {
    /// Create thresholds from milliseconds
    #[must_use]
    pub const fn from_millis(dispatch_ms: u64, delivery_ms: u64) -> Self {
        Self {
            dispatch_ms,
            delivery_ms,
        }
    }

    /// No slow-task reporting
    #[must_use]
    pub const fn disabled() -> Self {
        Self::from_millis(0, 0)
    }

    /// Dispatch threshold, `None` when disabled
    #[must_use]
    pub fn dispatch(&self) -> Option<Duration> {
        (self.dispatch_ms > 0).then(|| Duration::from_millis(self.dispatch_ms))
    }

    /// Delivery threshold, `None` when disabled
    #[must_use]
    pub fn delivery(&self) -> Option<Duration> {
        (self.delivery_ms > 0).then(|| Duration::from_millis(self.delivery_ms))
    }

    /// Whether any check is active
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.dispatch_ms > 0 || self.delivery_ms > 0
    }
}

/// Configuration for a single lane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Lane name, used for diagnostics and the worker thread name
    pub name: String,
    /// Slow-task thresholds
    #[serde(default)]
    pub thresholds: SlowTaskThresholds,
    /// Resolve this name to another lane instead of starting a worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_of: Option<String>,
}

impl LaneConfig {
    /// Create a lane config with reporting disabled
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            thresholds: SlowTaskThresholds::disabled(),
            alias_of: None,
        }
    }

    /// Set slow-task thresholds
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: SlowTaskThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Make this name an alias of another lane
    #[must_use]
    pub fn aliased_to(mut self, target: impl Into<String>) -> Self {
        self.alias_of = Some(target.into());
        self
    }

    /// Whether this entry owns a worker
    #[must_use]
    pub fn is_alias(&self) -> bool {
        self.alias_of.is_some()
    }
}

/// Every lane a process starts with
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LaneSetConfig {
    /// Lanes in declaration order
    pub lanes: Vec<LaneConfig>,
}

impl LaneSetConfig {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a lane
    #[must_use]
    pub fn with_lane(mut self, lane: LaneConfig) -> Self {
        self.lanes.push(lane);
        self
    }

    /// A typical profile for an interactive application.
    ///
    /// `notif-inflation` gets its own worker only when `dedicated_inflation`
    /// is set; otherwise it shares `background`.
    #[must_use]
    pub fn interactive_defaults(dedicated_inflation: bool) -> Self {
        let inflation = LaneConfig::new("notif-inflation");
        let inflation = if dedicated_inflation {
            inflation.with_thresholds(SlowTaskThresholds::from_millis(1000, 1000))
        } else {
            inflation.aliased_to("background")
        };

        Self::new()
            .with_lane(LaneConfig::new("main"))
            .with_lane(
                LaneConfig::new("background")
                    .with_thresholds(SlowTaskThresholds::from_millis(1000, 1000)),
            )
            .with_lane(
                LaneConfig::new("broadcast")
                    .with_thresholds(SlowTaskThresholds::from_millis(1000, 1000)),
            )
            .with_lane(
                LaneConfig::new("long-running")
                    .with_thresholds(SlowTaskThresholds::from_millis(2500, 2500)),
            )
            .with_lane(inflation)
            .with_lane(LaneConfig::new("time-tick"))
    }

    /// Parse and validate JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the set is invalid
    pub fn from_json_str(json: &str) -> LaneResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is invalid
    pub fn from_path(path: impl AsRef<Path>) -> LaneResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| LaneError::invalid_config(path.display().to_string(), e.to_string()))?;
        Self::from_json_str(&json)
    }

    /// Serialize to pretty JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json_pretty(&self) -> LaneResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check names are unique and non-empty, aliases resolve, and no alias
    /// chain loops.
    ///
    /// # Errors
    ///
    /// Returns the first problem found
    pub fn validate(&self) -> LaneResult<()> {
        let mut seen = HashSet::new();
        for (i, lane) in self.lanes.iter().enumerate() {
            if lane.name.trim().is_empty() {
                return Err(LaneError::invalid_config(
                    format!("lanes[{i}].name"),
                    "must not be empty",
                ));
            }
            if !seen.insert(lane.name.as_str()) {
                return Err(LaneError::DuplicateLane {
                    name: lane.name.clone(),
                });
            }
        }

        for lane in &self.lanes {
            if let Some(target) = &lane.alias_of {
                if !seen.contains(target.as_str()) {
                    return Err(LaneError::invalid_config(
                        format!("{}.alias_of", lane.name),
                        format!("unknown lane {target}"),
                    ));
                }
            }
            self.resolve(&lane.name)?;
        }

        Ok(())
    }

    /// Follow aliases from `name` to the lane that owns a worker.
    ///
    /// # Errors
    ///
    /// Returns error if the name is unknown or the alias chain loops
    pub fn resolve<'a>(&'a self, name: &'a str) -> LaneResult<&'a str> {
        let by_name: HashMap<&str, &LaneConfig> =
            self.lanes.iter().map(|l| (l.name.as_str(), l)).collect();

        let mut current = name;
        let mut hops = 0;
        loop {
            let lane = by_name.get(current).ok_or_else(|| LaneError::LaneNotFound {
                name: current.to_string(),
            })?;
            match &lane.alias_of {
                None => return Ok(current),
                Some(target) => {
                    hops += 1;
                    if hops > self.lanes.len() {
                        return Err(LaneError::AliasCycle {
                            name: name.to_string(),
                        });
                    }
                    current = target.as_str();
                }
            }
        }
    }
}
