//! Saved bench settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bench::context::{BenchCtx, Termination};
use crate::device::DriverSpec;
use crate::dispatcher::Dispatcher;
use crate::ramp::RampConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to access config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fixed output for a supply test
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SupplyConfig {
    pub voltage: f64,
    pub current_limit: f64,

    /// End the run after this long; runs until interrupted if unset
    pub duration_s: Option<f64>,
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            voltage: 5.0,
            current_limit: 1.0,
            duration_s: None,
        }
    }
}

/// Everything needed to run a test, loadable from JSON.
/// Missing fields take their defaults.
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Instrument to open, as `driver:key=value:...`
    pub driver: Option<DriverSpec>,

    /// Poll period for supply tests; sink tests poll once per ramp step
    pub poll_period_ms: u64,

    pub ramp: RampConfig,

    /// Sink tests stop when the terminal voltage drops below this
    pub safe_voltage: f64,

    pub supply: SupplyConfig,

    pub ctx: BenchCtx,

    /// Consumers of per-tick data
    pub dispatchers: Vec<Box<dyn Dispatcher>>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            driver: None,
            poll_period_ms: 500,
            ramp: RampConfig::default(),
            safe_voltage: 0.0,
            supply: SupplyConfig::default(),
            ctx: BenchCtx::default(),
            dispatchers: Vec::new(),
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    /// Criteria that end a supply test
    pub fn supply_termination(&self) -> Vec<Termination> {
        self.supply
            .duration_s
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .map(Termination::Timeout)
            .into_iter()
            .collect()
    }
}
