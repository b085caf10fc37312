//! Tablet Core Library
//!
//! Shared value types for the tablet replica rebalancer.
//! This crate provides:
//! - Cluster inspection summaries (server health, table and tablet summaries)
//! - Concrete and table-level replica move descriptions
//! - Table name filtering

pub mod filter;
pub mod inspection;
pub mod moves;

pub use filter::TableFilter;
pub use inspection::{
    CheckResult, InspectionResults, ReplicaSummary, ServerHealth, ServerHealthSummary,
    TableSummary, TabletSummary,
};
pub use moves::{MovesInProgress, ReplicaMove, TableReplicaMove};

/// Default cap on concurrent move operations touching a single tablet server
pub const DEFAULT_MAX_MOVES_PER_SERVER: usize = 5;

/// Default staleness interval in seconds
pub const DEFAULT_MAX_STALENESS_INTERVAL_SECS: u64 = 300;
