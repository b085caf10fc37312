//! Move transport
//!
//! The runner issues replica moves and polls their progress through
//! [`MoveTransport`]. A move is a Raft configuration change: the destination
//! replica is added, and the source one is removed once the new replica has
//! caught up.

use tablet_core::ReplicaMove;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Cluster unreachable: {0}")]
    Unreachable(String),

    #[error("Tablet {tablet_id}: move rejected: {reason}")]
    Rejected { tablet_id: String, reason: String },

    #[error("Tablet {tablet_id}: Raft config changed (expected opid index {expected}, found {actual})")]
    StaleConfig {
        tablet_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Tablet not found: {0}")]
    TabletNotFound(String),

    #[error("Tablet {0}: no leader to serve the request")]
    LeaderUnavailable(String),

    #[error("Timed out waiting for response")]
    Timeout,
}

/// Progress of a move that was accepted by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveStatus {
    InProgress,
    /// Source replica removed, destination replica is a voter
    Completed,
    /// The move will not complete; the tablet is left as it was
    Failed(String),
}

#[async_trait::async_trait]
pub trait MoveTransport: Send + Sync {
    /// Establish connectivity with the cluster masters
    async fn connect(&self, master_addresses: &[String]) -> Result<(), TransportError>;

    /// Start a move. If the move carries a config opid index, it must be
    /// rejected when the tablet's Raft config has moved past it.
    ///
    /// `Unreachable` means the cluster as a whole cannot be reached and ends
    /// the run; any other error concerns this move only.
    async fn issue_move(&self, mv: &ReplicaMove) -> Result<(), TransportError>;

    /// Check on a previously issued move. An error means its state is unknown.
    async fn poll_move(&self, mv: &ReplicaMove) -> Result<MoveStatus, TransportError>;
}
