//! Configuration for the node agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleet_id::NodeId;

/// Settings for talking to the local hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorSettings {
    /// Bridge interface whose global addresses are reported as the node's
    /// public addresses.
    pub bridge_name: String,

    /// Upper bound on a VM start.
    pub start_timeout: Duration,

    /// Upper bound on a VM stop.
    pub stop_timeout: Duration,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            bridge_name: "fleetbr0".to_string(),
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(60),
        }
    }
}

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Directory holding the local document store.
    pub data_dir: PathBuf,

    pub heartbeat_interval: Duration,

    pub reconcile_interval: Duration,

    pub hypervisor: HypervisorSettings,

    /// Default log filter (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_id = match var("FLEET_NODE_ID") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("FLEET_NODE_ID is not a node id: {raw}"))?,
            None => NodeId::new(),
        };

        let data_dir = var("FLEET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/fleet"));

        let number = |key: &str, default: u64| -> u64 {
            var(key).and_then(|s| s.parse().ok()).unwrap_or(default)
        };
        // Task periods; a zero period cannot drive a ticker.
        let period = |key: &str, default: u64| -> Result<u64> {
            match number(key, default) {
                0 => bail!("{key} must be greater than zero"),
                value => Ok(value),
            }
        };

        let defaults = HypervisorSettings::default();
        let hypervisor = HypervisorSettings {
            bridge_name: var("FLEET_BRIDGE_NAME").unwrap_or(defaults.bridge_name),
            start_timeout: Duration::from_secs(number("FLEET_START_TIMEOUT_SECS", 30)),
            stop_timeout: Duration::from_secs(number("FLEET_STOP_TIMEOUT_SECS", 60)),
        };

        let log_level = var("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            node_id,
            data_dir,
            heartbeat_interval: Duration::from_millis(period("FLEET_HEARTBEAT_INTERVAL_MS", 1000)?),
            reconcile_interval: Duration::from_secs(period("FLEET_RECONCILE_INTERVAL_SECS", 5)?),
            hypervisor,
            log_level,
        })
    }

    /// Path of the SQLite document store.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("fleet.db")
    }
}
