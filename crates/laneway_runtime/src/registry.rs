//! Process-wide set of lanes, built once at startup and passed around by
//! reference.
//!
//! Each non-alias lane gets exactly one worker, one repeatable executor and
//! one message router. Aliased names resolve to the lane they point at.

use crate::executor::DelayableExecutor;
use crate::lane::Lane;
use crate::monitor::{LaneObserver, MetricsSnapshot, TracingObserver};
use crate::repeatable::RepeatableExecutor;
use crate::router::MessageRouter;
use indexmap::IndexMap;
use laneway_core::{Clock, LaneError, LaneResult, LaneSetConfig, MonotonicClock};
use std::sync::Arc;

struct LaneEntry {
    lane: Lane,
    repeatable: RepeatableExecutor,
    router: MessageRouter,
}

/// All lanes of a process
pub struct LaneRegistry {
    config: LaneSetConfig,
    lanes: IndexMap<String, LaneEntry>,
}

impl LaneRegistry {
    /// Validate `config` and start one worker per non-alias lane
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or a worker cannot start
    pub fn start(
        config: LaneSetConfig,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn LaneObserver>,
    ) -> LaneResult<Self> {
        config.validate()?;

        let mut lanes = IndexMap::new();
        for lane_config in config.lanes.iter().filter(|l| !l.is_alias()) {
            let lane = Lane::spawn(lane_config, Arc::clone(&clock), Arc::clone(&observer))?;
            let executor: Arc<dyn DelayableExecutor> = Arc::new(lane.clone());
            lanes.insert(
                lane_config.name.clone(),
                LaneEntry {
                    repeatable: RepeatableExecutor::new(Arc::clone(&executor)),
                    router: MessageRouter::new(executor),
                    lane,
                },
            );
        }

        tracing::info!(
            lanes = lanes.len(),
            aliases = config.lanes.len() - lanes.len(),
            "lane registry started"
        );
        Ok(Self { config, lanes })
    }

    /// Start on real time, logging through `tracing`
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or a worker cannot start
    pub fn start_default(config: LaneSetConfig) -> LaneResult<Self> {
        Self::start(config, Arc::new(MonotonicClock::new()), Arc::new(TracingObserver))
    }

    fn entry(&self, name: &str) -> LaneResult<&LaneEntry> {
        let resolved = self.config.resolve(name)?;
        self.lanes.get(resolved).ok_or_else(|| LaneError::LaneNotFound {
            name: name.to_string(),
        })
    }

    /// The lane registered as (or aliased to) `name`
    ///
    /// # Errors
    ///
    /// Returns error if no such lane exists
    pub fn lane(&self, name: &str) -> LaneResult<&Lane> {
        self.entry(name).map(|e| &e.lane)
    }

    /// The lane as a delayable executor
    ///
    /// # Errors
    ///
    /// Returns error if no such lane exists
    pub fn delayable(&self, name: &str) -> LaneResult<Arc<dyn DelayableExecutor>> {
        let lane = self.lane(name)?.clone();
        Ok(Arc::new(lane))
    }

    /// The lane's repeatable executor
    ///
    /// # Errors
    ///
    /// Returns error if no such lane exists
    pub fn repeatable(&self, name: &str) -> LaneResult<&RepeatableExecutor> {
        self.entry(name).map(|e| &e.repeatable)
    }

    /// The lane's message router
    ///
    /// # Errors
    ///
    /// Returns error if no such lane exists
    pub fn router(&self, name: &str) -> LaneResult<&MessageRouter> {
        self.entry(name).map(|e| &e.router)
    }

    /// Every configured name, aliases included, in configuration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.config.lanes.iter().map(|l| l.name.as_str())
    }

    /// Counters of every worker lane
    #[must_use]
    pub fn metrics(&self) -> IndexMap<String, MetricsSnapshot> {
        self.lanes
            .iter()
            .map(|(name, entry)| (name.clone(), entry.lane.metrics()))
            .collect()
    }

    /// Configuration the registry was started with
    #[must_use]
    pub fn config(&self) -> &LaneSetConfig {
        &self.config
    }
}

impl std::fmt::Debug for LaneRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneRegistry")
            .field("lanes", &self.lanes.keys().collect::<Vec<_>>())
            .finish()
    }
}
