//! Flow tracking
//!
//! Decoders feed every frame's flow id into the sharded `FlowTable` and bump
//! the `packets`/`bytes` counters. A background `FlowWorker` evicts idle
//! flows and publishes reports.
//!
//! # Example
//!
//! ```ignore
//! use flowtap::flow::{Flows, FlowsConfig};
//!
//! let flows = Flows::new(&FlowsConfig::default())?;
//! let worker = flows.start(publisher)?;
//! // hand `&flows` to each decoder
//! worker.stop().await;
//! ```

pub mod counters;
pub mod flowid;
pub mod table;
pub mod worker;

pub use counters::{CounterRegistry, FloatCounter, FlowStats, IntCounter, UintCounter};
pub use flowid::{FlowDirection, FlowIdBuilder, FlowIdFlags, FlowIdView, FlowKey};
pub use table::{Flow, FlowRef, FlowShard, FlowTable, ShardGuard};
pub use worker::{compute_ticks, FlowWorker, Ticks, WorkerHandle};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::publish::Publisher;

/// Configuration for flow tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowsConfig {
    /// Enable flow tracking
    pub enabled: bool,

    /// Idle time after which a flow is evicted
    #[serde(with = "crate::config::duration")]
    pub timeout: Duration,

    /// Interval between reports for live flows; `None` reports only on
    /// eviction
    #[serde(with = "crate::config::optional_duration")]
    pub period: Option<Duration>,
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(30),
            period: Some(Duration::from_secs(10)),
        }
    }
}

/// Flow table plus its counter registry
pub struct Flows {
    table: Arc<FlowTable>,
    timeout: Duration,
    period: Option<Duration>,
}

impl Flows {
    /// Validates the key layout and the worker intervals up front
    pub fn new(config: &FlowsConfig) -> Result<Self> {
        flowid::validate_layout()?;
        compute_ticks(config.timeout, config.period)?;

        let counters = Arc::new(CounterRegistry::new());
        Ok(Self {
            table: Arc::new(FlowTable::new(counters)),
            timeout: config.timeout,
            period: config.period,
        })
    }

    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    pub fn counters(&self) -> &Arc<CounterRegistry> {
        self.table.counters()
    }

    /// Worker over this table, not yet running
    pub fn worker(&self, publisher: Arc<dyn Publisher>) -> Result<FlowWorker> {
        FlowWorker::new(Arc::clone(&self.table), self.timeout, self.period, publisher)
    }

    /// Spawn the worker on the current tokio runtime
    pub fn start(&self, publisher: Arc<dyn Publisher>) -> Result<WorkerHandle> {
        Ok(self.worker(publisher)?.spawn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_default_config() {
        let config = FlowsConfig::default();
        assert!(config.enabled);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.period, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_new_rejects_bad_intervals() {
        let config = FlowsConfig {
            timeout: Duration::from_millis(10),
            ..Default::default()
        };
        assert!(matches!(Flows::new(&config), Err(Error::InvalidTimeout(_))));

        let config = FlowsConfig {
            period: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(matches!(Flows::new(&config), Err(Error::InvalidPeriod(_))));
    }

    #[test]
    fn test_config_from_toml() {
        let config: FlowsConfig = toml::from_str("timeout = \"1m\"\nperiod = \"-1\"").unwrap();
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.period, None);

        let config: FlowsConfig = toml::from_str("enabled = false").unwrap();
        assert!(!config.enabled);
        assert_eq!(config.period, Some(Duration::from_secs(10)));
    }
}
