//! Error types for the rebalancer
//!
//! Per-move failures never show up here: they are recovered inside the
//! runner. Everything in this enum ends the run.

use std::time::Duration;
use tablet_core::ServerHealth;
use thiserror::Error;

use crate::algo::AlgoError;
use crate::config::ConfigError;
use crate::inspector::InspectError;
use crate::transport::TransportError;

/// Result type alias for rebalancer operations
pub type Result<T> = std::result::Result<T, RebalanceError>;

#[derive(Error, Debug)]
pub enum RebalanceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cluster inspection failed: {0}")]
    Inspection(#[from] InspectError),

    #[error("Cannot connect to cluster: {0}")]
    Connectivity(#[from] TransportError),

    #[error("Invalid cluster balance model: {0}")]
    InvalidModel(String),

    #[error("Rebalancing algorithm error: {0}")]
    Algorithm(#[from] AlgoError),

    #[error("Tablet server {uuid} ({address}): unacceptable health status {health}")]
    UnhealthyServer {
        uuid: String,
        address: String,
        health: ServerHealth,
    },

    #[error("Stalled with no progress for more than {0:?}, aborting")]
    Stalled(Duration),
}
