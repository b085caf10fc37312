//! Cluster inspection summaries
//!
//! The shape of a cluster health/placement snapshot as produced by the
//! inspection tool: per-server health, per-table and per-tablet summaries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of a tablet server as seen by the inspection tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerHealth {
    /// Server responded and reported the expected identity
    Healthy,
    /// Server refused the inspection RPCs
    Unauthorized,
    /// Server could not be reached
    Unavailable,
    /// Server answered with a different UUID than the masters expect
    WrongServerUuid,
}

impl fmt::Display for ServerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerHealth::Healthy => "HEALTHY",
            ServerHealth::Unauthorized => "UNAUTHORIZED",
            ServerHealth::Unavailable => "UNAVAILABLE",
            ServerHealth::WrongServerUuid => "WRONG_SERVER_UUID",
        };
        f.write_str(s)
    }
}

/// Result of a health check of a tablet or table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckResult {
    Healthy,
    /// A replica is being copied or caught up
    Recovering,
    /// Fewer live voters than the replication factor, majority still available
    UnderReplicated,
    /// Replicas disagree on the Raft configuration
    ConsensusMismatch,
    /// No majority of voters is available
    Unavailable,
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckResult::Healthy => "HEALTHY",
            CheckResult::Recovering => "RECOVERING",
            CheckResult::UnderReplicated => "UNDER_REPLICATED",
            CheckResult::ConsensusMismatch => "CONSENSUS_MISMATCH",
            CheckResult::Unavailable => "UNAVAILABLE",
        };
        f.write_str(s)
    }
}

/// Summary of one tablet server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHealthSummary {
    pub uuid: String,
    pub address: String,
    pub health: ServerHealth,
    /// Location label assigned to the server, if any
    #[serde(default)]
    pub location: Option<String>,
}

impl ServerHealthSummary {
    pub fn is_healthy(&self) -> bool {
        self.health == ServerHealth::Healthy
    }
}

/// Summary of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub id: String,
    pub name: String,
    pub replication_factor: u32,
    pub result: CheckResult,
}

/// One replica of a tablet as listed in the tablet's Raft configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSummary {
    pub ts_uuid: String,
    #[serde(default)]
    pub ts_address: Option<String>,
    /// Whether the hosting tablet server is healthy
    pub ts_healthy: bool,
    #[serde(default)]
    pub is_leader: bool,
    #[serde(default = "default_voter")]
    pub is_voter: bool,
}

fn default_voter() -> bool {
    true
}

/// Summary of one tablet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSummary {
    pub id: String,
    pub table_id: String,
    pub table_name: String,
    pub result: CheckResult,
    pub replicas: Vec<ReplicaSummary>,
    /// Opid index of the Raft configuration the masters know about
    #[serde(default)]
    pub config_opid_idx: Option<i64>,
}

impl TabletSummary {
    /// Check whether the tablet has a replica at the given server
    pub fn has_replica_on(&self, ts_uuid: &str) -> bool {
        self.replicas.iter().any(|r| r.ts_uuid == ts_uuid)
    }
}

/// Full output of one inspection run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionResults {
    pub server_summaries: Vec<ServerHealthSummary>,
    pub table_summaries: Vec<TableSummary>,
    pub tablet_summaries: Vec<TabletSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_health_json_names() {
        let json = serde_json::to_string(&ServerHealth::WrongServerUuid).unwrap();
        assert_eq!(json, "\"WRONG_SERVER_UUID\"");

        let health: ServerHealth = serde_json::from_str("\"UNAVAILABLE\"").unwrap();
        assert_eq!(health, ServerHealth::Unavailable);
        assert_eq!(health.to_string(), "UNAVAILABLE");
    }

    #[test]
    fn test_replica_summary_defaults() {
        let replica: ReplicaSummary =
            serde_json::from_str(r#"{"ts_uuid": "ts-1", "ts_healthy": true}"#).unwrap();
        assert!(replica.is_voter);
        assert!(!replica.is_leader);
        assert_eq!(replica.ts_address, None);
    }

    #[test]
    fn test_tablet_has_replica_on() {
        let tablet = TabletSummary {
            id: "t1".to_string(),
            table_id: "tbl".to_string(),
            table_name: "metrics".to_string(),
            result: CheckResult::Healthy,
            replicas: vec![ReplicaSummary {
                ts_uuid: "ts-1".to_string(),
                ts_address: None,
                ts_healthy: true,
                is_leader: true,
                is_voter: true,
            }],
            config_opid_idx: Some(7),
        };
        assert!(tablet.has_replica_on("ts-1"));
        assert!(!tablet.has_replica_on("ts-2"));
    }
}
