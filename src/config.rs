use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::graph::DEFAULT_FUSION_WINDOW;

/// Which optimizations the [`Scheduler`](crate::Scheduler) runs on each
/// flush, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Fuse compatible tasks.
    pub fusion: bool,
    /// Number of consecutive pending tasks analyzed together for fusion.
    pub fusion_window: usize,
    /// Remove redundant list generations.
    pub listgen: bool,
    /// Drop list generations of lists already up to date at insertion.
    pub listgen_filter: bool,
    pub dead_store: bool,
    pub activation_demotion: bool,
    /// Upper bound on rounds of the optimization loop per flush.
    pub max_optimize_iterations: usize,
    /// Flush automatically after this many launches.
    pub flush_every: Option<usize>,
    /// Verify the graph after every pass and panic on a broken invariant.
    pub debug_verify: bool,
    /// Write a `.dot` file of the graph after every optimization round.
    pub dot_dump_dir: Option<Utf8PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fusion: true,
            fusion_window: DEFAULT_FUSION_WINDOW,
            listgen: true,
            listgen_filter: true,
            dead_store: true,
            activation_demotion: true,
            max_optimize_iterations: 5,
            flush_every: None,
            debug_verify: false,
            dot_dump_dir: None,
        }
    }
}

impl SchedulerConfig {
    /// Parses a config from JSON. Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// A config with every optimization turned off.
    pub fn unoptimized() -> Self {
        Self {
            fusion: false,
            listgen: false,
            listgen_filter: false,
            dead_store: false,
            activation_demotion: false,
            ..Self::default()
        }
    }
}
