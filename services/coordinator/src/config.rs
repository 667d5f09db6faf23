//! Configuration for the coordinator.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::lifecycle::LifecycleConfig;
use crate::resources::AllocationStrategy;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON topology file. Without one the fleet starts empty.
    pub topology_path: Option<PathBuf>,

    /// Initial allocation strategy.
    pub strategy: AllocationStrategy,

    /// Monitor interval in seconds.
    pub check_interval_secs: u64,

    /// Restart/redistribution hook timeout in seconds.
    pub hook_timeout_secs: u64,

    /// Missed cycles tolerated before an agent fails.
    pub failure_threshold: u32,

    /// Highest retry count at which recovery is still attempted.
    pub recovery_limit: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topology_path: None,
            strategy: AllocationStrategy::default(),
            check_interval_secs: 30,
            hook_timeout_secs: 10,
            failure_threshold: 2,
            recovery_limit: 5,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let topology_path = lookup("ORBIT_TOPOLOGY_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let strategy = match lookup("ORBIT_ALLOCATION_STRATEGY") {
            Some(name) => name
                .parse::<AllocationStrategy>()
                .context("ORBIT_ALLOCATION_STRATEGY must be bin-packing, spread or random")?,
            None => defaults.strategy,
        };

        let check_interval_secs = parse_var(
            &lookup,
            "ORBIT_CHECK_INTERVAL_SECS",
            defaults.check_interval_secs,
        )?;
        if check_interval_secs == 0 {
            return Err(anyhow!("ORBIT_CHECK_INTERVAL_SECS must be at least 1"));
        }

        let hook_timeout_secs =
            parse_var(&lookup, "ORBIT_HOOK_TIMEOUT_SECS", defaults.hook_timeout_secs)?;
        let failure_threshold =
            parse_var(&lookup, "ORBIT_FAILURE_THRESHOLD", defaults.failure_threshold)?;
        let recovery_limit = parse_var(&lookup, "ORBIT_RECOVERY_LIMIT", defaults.recovery_limit)?;

        let log_level = lookup("ORBIT_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            topology_path,
            strategy,
            check_interval_secs,
            hook_timeout_secs,
            failure_threshold,
            recovery_limit,
            log_level,
        })
    }

    /// Lifecycle knobs derived from this configuration.
    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            check_interval: Duration::from_secs(self.check_interval_secs),
            hook_timeout: Duration::from_secs(self.hook_timeout_secs),
            failure_threshold: self.failure_threshold,
            recovery_limit: self.recovery_limit,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        None => Ok(default),
    }
}
