//! Replica move descriptions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A high-level move: some replica of a table goes from one server to another.
///
/// This is what the placement algorithm outputs; the concrete tablet is
/// picked later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableReplicaMove {
    pub table_id: String,
    pub from: String,
    pub to: String,
}

/// A concrete move of one tablet replica between two tablet servers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaMove {
    pub tablet_id: String,
    pub ts_uuid_from: String,
    pub ts_uuid_to: String,
    /// CAS token: opid index of the Raft config the move was planned against.
    /// `None` makes the move unconditional.
    #[serde(default)]
    pub config_opid_idx: Option<i64>,
}

impl ReplicaMove {
    pub fn new(
        tablet_id: impl Into<String>,
        ts_uuid_from: impl Into<String>,
        ts_uuid_to: impl Into<String>,
    ) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            ts_uuid_from: ts_uuid_from.into(),
            ts_uuid_to: ts_uuid_to.into(),
            config_opid_idx: None,
        }
    }

    /// Guard the move with the given Raft config opid index
    pub fn with_config_opid_idx(mut self, opid_idx: i64) -> Self {
        self.config_opid_idx = Some(opid_idx);
        self
    }
}

impl fmt::Display for ReplicaMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tablet {}: {} -> {}",
            self.tablet_id, self.ts_uuid_from, self.ts_uuid_to
        )
    }
}

/// Moves that have been scheduled and are not yet resolved.
///
/// Keyed by tablet id; a tablet has at most one move in flight.
pub type MovesInProgress = HashMap<String, ReplicaMove>;
