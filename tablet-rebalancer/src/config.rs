//! Rebalancer configuration
//!
//! Configuration loaded from environment variables and command line.

use std::time::Duration;
use tablet_core::{TableFilter, DEFAULT_MAX_MOVES_PER_SERVER, DEFAULT_MAX_STALENESS_INTERVAL_SECS};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Rebalancer configuration
#[derive(Debug, Clone)]
pub struct RebalancerConfig {
    /// Master RPC endpoints
    pub master_addresses: Vec<String>,

    /// Names (or glob patterns) of tables to balance. Empty means every table
    /// and the whole cluster.
    pub table_filters: Vec<String>,

    /// Maximum number of move operations running concurrently on one server,
    /// counting moves where the server is either source or destination
    pub max_moves_per_server: usize,

    /// Maximum time without scheduling or completing a single move
    pub max_staleness_interval_secs: u64,

    /// Maximum run time in seconds, 0 means no limit
    pub max_run_time_secs: u64,

    /// Whether replicas of tablets with replication factor 1 may be moved
    pub move_rf1_replicas: bool,

    /// Log per-table replica distribution on every cycle
    pub output_replica_distribution_details: bool,

    /// Only balance servers in this location
    pub location: Option<String>,

    /// Upper bound for a single transport call
    pub rpc_timeout_secs: u64,

    /// Pause between status polls of in-flight moves
    pub poll_interval_ms: u64,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            master_addresses: Vec::new(),
            table_filters: Vec::new(),
            max_moves_per_server: DEFAULT_MAX_MOVES_PER_SERVER,
            max_staleness_interval_secs: DEFAULT_MAX_STALENESS_INTERVAL_SECS,
            max_run_time_secs: 0,
            move_rf1_replicas: false,
            output_replica_distribution_details: false,
            location: None,
            rpc_timeout_secs: 30,
            poll_interval_ms: 200,
        }
    }
}

impl RebalancerConfig {
    /// Create configuration from environment variables.
    ///
    /// Unset variables keep their defaults; set but unparseable ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            master_addresses: env_list("REBALANCER_MASTER_ADDRESSES"),
            table_filters: env_list("REBALANCER_TABLES"),
            max_moves_per_server: env_parse(
                "REBALANCER_MAX_MOVES_PER_SERVER",
                defaults.max_moves_per_server,
            )?,
            max_staleness_interval_secs: env_parse(
                "REBALANCER_MAX_STALENESS_INTERVAL",
                defaults.max_staleness_interval_secs,
            )?,
            max_run_time_secs: env_parse("REBALANCER_MAX_RUN_TIME", defaults.max_run_time_secs)?,
            move_rf1_replicas: env_flag("REBALANCER_MOVE_RF1_REPLICAS"),
            output_replica_distribution_details: env_flag("REBALANCER_OUTPUT_DETAILS"),
            location: std::env::var("REBALANCER_LOCATION")
                .ok()
                .filter(|v| !v.is_empty()),
            rpc_timeout_secs: env_parse("REBALANCER_RPC_TIMEOUT", defaults.rpc_timeout_secs)?,
            poll_interval_ms: env_parse("REBALANCER_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
        })
    }

    /// Check invariants the rest of the rebalancer relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_moves_per_server == 0 {
            return Err(ConfigError::InvalidValue(
                "max_moves_per_server".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.rpc_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "rpc_timeout_secs".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        self.table_filter()?;
        Ok(())
    }

    /// Compile the table name patterns
    pub fn table_filter(&self) -> Result<TableFilter, ConfigError> {
        TableFilter::new(&self.table_filters)
            .map_err(|e| ConfigError::InvalidValue("table_filters".to_string(), e.to_string()))
    }

    /// Get staleness interval as Duration
    pub fn max_staleness_interval(&self) -> Duration {
        Duration::from_secs(self.max_staleness_interval_secs)
    }

    /// Get maximum run time, `None` if unbounded
    pub fn max_run_time(&self) -> Option<Duration> {
        (self.max_run_time_secs != 0).then(|| Duration::from_secs(self.max_run_time_secs))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), v)),
        Err(_) => Ok(default),
    }
}
