//! Tablet Rebalancer Library
//!
//! This crate moves tablet replicas between tablet servers until every table,
//! and the cluster as a whole, has its replicas spread evenly.
//!
//! The rebalancer repeatedly:
//! - Inspects server health and replica placement
//! - Asks the placement algorithm for table-level moves
//! - Resolves them into moves of concrete tablet replicas
//! - Schedules the moves under a per-server concurrency cap and tracks them

pub mod algo;
pub mod algo_runner;
pub mod cluster_info;
pub mod config;
pub mod error;
pub mod inspector;
pub mod rebalancer;
pub mod replicas;
pub mod runner;
pub mod sim;
pub mod transport;

// Re-export main types
pub use algo::{AlgoError, EqualSkewOption, RebalancingAlgo, TwoDimensionalGreedyAlgo};
pub use algo_runner::{AlgoBasedRunner, TwoDimensionalGreedyRunner};
pub use cluster_info::{build_cluster_info, ClusterBalanceInfo, ClusterInfo, TableBalanceInfo};
pub use config::{ConfigError, RebalancerConfig};
pub use error::{RebalanceError, Result};
pub use inspector::{fetch_cluster_raw_info, ClusterInspector, ClusterRawInfo, InspectError};
pub use rebalancer::{Rebalancer, RunStatus};
pub use replicas::{filter_moves, find_replicas};
pub use runner::{BaseRunner, OpCounters, PollOutcome, Runner, ScheduleOutcome};
pub use sim::{ClusterSnapshot, InMemoryCluster, SnapshotError, SnapshotTablet};
pub use transport::{MoveStatus, MoveTransport, TransportError};
