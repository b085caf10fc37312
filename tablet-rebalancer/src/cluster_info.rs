//! Cluster balance model
//!
//! Builds the per-table and per-server replica counts the placement algorithm
//! works on. Moves still in progress are treated as if they had already
//! completed, so the algorithm does not propose them a second time.

use std::collections::{BTreeMap, HashSet};
use tablet_core::{MovesInProgress, TableReplicaMove};
use tracing::debug;

use crate::algo::AlgoError;
use crate::error::{RebalanceError, Result};
use crate::inspector::ClusterRawInfo;

/// Replica distribution of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBalanceInfo {
    pub table_id: String,
    /// Replica count of the table per tablet server, including servers with none
    pub replicas_by_server: BTreeMap<String, i32>,
}

impl TableBalanceInfo {
    pub fn max_count(&self) -> i32 {
        self.replicas_by_server.values().copied().max().unwrap_or(0)
    }

    pub fn min_count(&self) -> i32 {
        self.replicas_by_server.values().copied().min().unwrap_or(0)
    }

    /// Difference between the most and the least loaded server
    pub fn skew(&self) -> i32 {
        self.max_count() - self.min_count()
    }

    /// Servers hosting exactly `count` replicas of the table
    pub fn servers_with_count(&self, count: i32) -> impl Iterator<Item = &str> {
        self.replicas_by_server
            .iter()
            .filter(move |(_, c)| **c == count)
            .map(|(uuid, _)| uuid.as_str())
    }
}

/// Replica distribution of the whole cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterBalanceInfo {
    /// Per-table distribution keyed by table id
    pub tables: BTreeMap<String, TableBalanceInfo>,
    /// Total replica count per tablet server
    pub replicas_by_server: BTreeMap<String, i32>,
}

impl ClusterBalanceInfo {
    pub fn max_table_skew(&self) -> i32 {
        self.tables.values().map(|t| t.skew()).max().unwrap_or(0)
    }

    /// Difference between total replica counts of the most and least loaded servers
    pub fn cluster_skew(&self) -> i32 {
        let max = self.replicas_by_server.values().copied().max().unwrap_or(0);
        let min = self.replicas_by_server.values().copied().min().unwrap_or(0);
        max - min
    }

    /// Total replica count of a server, 0 for unknown servers
    pub fn total_count(&self, ts_uuid: &str) -> i32 {
        self.replicas_by_server.get(ts_uuid).copied().unwrap_or(0)
    }

    /// Update the counts as if the move had been carried out
    pub fn apply_move(&mut self, mv: &TableReplicaMove) -> std::result::Result<(), AlgoError> {
        let table = self
            .tables
            .get_mut(&mv.table_id)
            .ok_or_else(|| AlgoError::InvalidModel(format!("unknown table {}", mv.table_id)))?;

        for uuid in [&mv.from, &mv.to] {
            if !self.replicas_by_server.contains_key(uuid) || !table.replicas_by_server.contains_key(uuid) {
                return Err(AlgoError::InvalidModel(format!("unknown tablet server {}", uuid)));
            }
        }
        if table.replicas_by_server[&mv.from] <= 0 {
            return Err(AlgoError::InvalidModel(format!(
                "table {}: no replicas to move from {}",
                mv.table_id, mv.from
            )));
        }

        for (uuid, delta) in [(&mv.from, -1), (&mv.to, 1)] {
            if let Some(count) = table.replicas_by_server.get_mut(uuid) {
                *count += delta;
            }
            if let Some(count) = self.replicas_by_server.get_mut(uuid) {
                *count += delta;
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} tables, {} tablet servers, max table skew {}, cluster skew {}",
            self.tables.len(),
            self.replicas_by_server.len(),
            self.max_table_skew(),
            self.cluster_skew()
        )
    }
}

/// Input of the placement algorithm
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    pub balance: ClusterBalanceInfo,
}

/// Build the balance model from the raw cluster info.
///
/// Only healthy tablet servers are taken into account. Unless
/// `move_rf1_replicas` is set, tablets of tables with replication factor 1
/// are left out.
pub fn build_cluster_info(
    raw_info: &ClusterRawInfo,
    moves_in_progress: &MovesInProgress,
    move_rf1_replicas: bool,
) -> Result<ClusterInfo> {
    let mut replicas_by_server: BTreeMap<String, i32> = BTreeMap::new();
    for s in &raw_info.server_summaries {
        if !s.is_healthy() {
            debug!(
                ts = %s.uuid,
                address = %s.address,
                health = %s.health,
                "Skipping tablet server because of its non-HEALTHY status"
            );
            continue;
        }
        replicas_by_server.insert(s.uuid.clone(), 0);
    }

    let rf1_tables: HashSet<&str> = if move_rf1_replicas {
        HashSet::new()
    } else {
        raw_info
            .table_summaries
            .iter()
            .filter(|t| t.replication_factor == 1)
            .map(|t| t.id.as_str())
            .collect()
    };

    let mut table_counts: BTreeMap<String, BTreeMap<String, i32>> = BTreeMap::new();

    for tablet in &raw_info.tablet_summaries {
        if rf1_tables.contains(tablet.table_id.as_str()) {
            debug!(tablet = %tablet.id, table = %tablet.table_name, "Tablet has a single replica, skipping");
            continue;
        }

        let mut holders: Vec<&str> = Vec::with_capacity(tablet.replicas.len() + 1);
        for r in &tablet.replicas {
            if !holders.contains(&r.ts_uuid.as_str()) {
                holders.push(&r.ts_uuid);
            }
        }

        if let Some(mv) = moves_in_progress.get(&tablet.id) {
            holders.retain(|uuid| *uuid != mv.ts_uuid_from);
            if !holders.contains(&mv.ts_uuid_to.as_str()) {
                holders.push(&mv.ts_uuid_to);
            }
        }

        let per_server = table_counts.entry(tablet.table_id.clone()).or_default();
        for uuid in holders {
            match replicas_by_server.get_mut(uuid) {
                Some(total) => {
                    *total += 1;
                    *per_server.entry(uuid.to_string()).or_default() += 1;
                }
                None => {
                    debug!(tablet = %tablet.id, ts = %uuid, "Skipping replica at tablet server not among known healthy ones");
                }
            }
        }
    }

    let mut tables = BTreeMap::new();
    for (table_id, mut per_server) in table_counts {
        for uuid in replicas_by_server.keys() {
            per_server.entry(uuid.clone()).or_insert(0);
        }
        tables.insert(
            table_id.clone(),
            TableBalanceInfo {
                table_id,
                replicas_by_server: per_server,
            },
        );
    }

    for (uuid, total) in &replicas_by_server {
        let by_tables: i32 = tables
            .values()
            .map(|t: &TableBalanceInfo| t.replicas_by_server.get(uuid).copied().unwrap_or(0))
            .sum();
        if by_tables != *total {
            return Err(RebalanceError::InvalidModel(format!(
                "tablet server {}: {} replicas in total but {} by tables",
                uuid, total, by_tables
            )));
        }
    }

    Ok(ClusterInfo {
        balance: ClusterBalanceInfo {
            tables,
            replicas_by_server,
        },
    })
}
