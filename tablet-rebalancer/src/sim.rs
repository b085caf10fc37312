//! In-memory cluster
//!
//! A simulated cluster serving both inspection and move requests. Used by the
//! binary to rebalance a snapshot loaded from a JSON file, and by tests.
//!
//! A move adds the destination replica as a non-voter when issued and removes
//! the source replica once it completes. Every Raft config change bumps the
//! tablet's opid index. Moves advance one step per status poll, and all of
//! them advance on every inspection.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tablet_core::{
    CheckResult, InspectionResults, ReplicaMove, ReplicaSummary, ServerHealth,
    ServerHealthSummary, TableFilter, TableSummary, TabletSummary,
};
use thiserror::Error;
use tracing::debug;

use crate::inspector::{ClusterInspector, InspectError};
use crate::transport::{MoveStatus, MoveTransport, TransportError};

/// Snapshot loading errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid snapshot: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A tablet and the servers hosting its replicas, leader first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTablet {
    pub id: String,
    pub table_id: String,
    pub replicas: Vec<String>,
    #[serde(default = "default_opid_idx")]
    pub config_opid_idx: i64,
}

fn default_opid_idx() -> i64 {
    1
}

/// Cluster layout the simulation starts from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub servers: Vec<ServerHealthSummary>,
    pub tables: Vec<TableSummary>,
    pub tablets: Vec<SnapshotTablet>,
}

impl ClusterSnapshot {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn add_server(&mut self, uuid: &str) -> &mut Self {
        self.servers.push(ServerHealthSummary {
            uuid: uuid.to_string(),
            address: format!("{}:7050", uuid),
            health: ServerHealth::Healthy,
            location: None,
        });
        self
    }

    pub fn add_table(&mut self, name: &str, replication_factor: u32) -> &mut Self {
        self.tables.push(TableSummary {
            id: name.to_string(),
            name: name.to_string(),
            replication_factor,
            result: CheckResult::Healthy,
        });
        self
    }

    pub fn add_tablet(&mut self, id: &str, table_id: &str, replicas: &[&str]) -> &mut Self {
        self.tablets.push(SnapshotTablet {
            id: id.to_string(),
            table_id: table_id.to_string(),
            replicas: replicas.iter().map(|r| r.to_string()).collect(),
            config_opid_idx: default_opid_idx(),
        });
        self
    }

    /// Number of replicas per server
    pub fn replicas_per_server(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> =
            self.servers.iter().map(|s| (s.uuid.clone(), 0)).collect();
        for tablet in &self.tablets {
            for uuid in &tablet.replicas {
                *counts.entry(uuid.clone()).or_default() += 1;
            }
        }
        counts
    }
}

#[derive(Debug)]
struct InFlightMove {
    mv: ReplicaMove,
    steps_left: u32,
}

#[derive(Debug, Default)]
struct ClusterState {
    snapshot: ClusterSnapshot,
    /// Destination replicas not yet promoted, by tablet id
    in_flight: HashMap<String, InFlightMove>,
    /// Outcomes of moves finished but not polled yet
    finished: HashMap<String, MoveStatus>,
    moves_per_server: HashMap<String, usize>,
    peak_moves_per_server: HashMap<String, usize>,
    completed: u64,

    move_latency: u32,
    unreachable: bool,
    stalled: bool,
    reject_issue: HashSet<String>,
    poll_errors: HashSet<String>,
    fail_moves: HashSet<String>,
}

impl ClusterState {
    fn tablet_mut(&mut self, tablet_id: &str) -> Option<&mut SnapshotTablet> {
        self.snapshot.tablets.iter_mut().find(|t| t.id == tablet_id)
    }

    fn start_move(&mut self, mv: &ReplicaMove) {
        self.finished.remove(&mv.tablet_id);
        for uuid in [&mv.ts_uuid_from, &mv.ts_uuid_to] {
            let count = self.moves_per_server.entry(uuid.clone()).or_default();
            *count += 1;
            let peak = self.peak_moves_per_server.entry(uuid.clone()).or_default();
            *peak = (*peak).max(*count);
        }
        self.in_flight.insert(
            mv.tablet_id.clone(),
            InFlightMove {
                mv: mv.clone(),
                steps_left: self.move_latency,
            },
        );
    }

    /// Advance one move, finishing it once it has no steps left
    fn advance(&mut self, tablet_id: &str) {
        if self.stalled {
            return;
        }
        let Some(entry) = self.in_flight.get_mut(tablet_id) else {
            return;
        };
        entry.steps_left = entry.steps_left.saturating_sub(1);
        if entry.steps_left > 0 {
            return;
        }
        let Some(InFlightMove { mv, .. }) = self.in_flight.remove(tablet_id) else {
            return;
        };

        for uuid in [&mv.ts_uuid_from, &mv.ts_uuid_to] {
            if let Some(count) = self.moves_per_server.get_mut(uuid) {
                *count = count.saturating_sub(1);
            }
        }

        let failed = self.fail_moves.remove(tablet_id);
        if let Some(tablet) = self.tablet_mut(tablet_id) {
            let gone = if failed { &mv.ts_uuid_to } else { &mv.ts_uuid_from };
            tablet.replicas.retain(|r| r != gone);
            tablet.config_opid_idx += 1;
        }

        let status = if failed {
            MoveStatus::Failed("new replica failed to catch up".to_string())
        } else {
            self.completed += 1;
            MoveStatus::Completed
        };
        debug!(tablet = %tablet_id, status = ?status, "Simulated move finished");
        self.finished.insert(tablet_id.to_string(), status);
    }

    fn tablet_result(&self, tablet: &SnapshotTablet, replication_factor: u32) -> CheckResult {
        if self.in_flight.contains_key(&tablet.id) {
            return CheckResult::Recovering;
        }
        let healthy = tablet
            .replicas
            .iter()
            .filter(|uuid| self.is_server_healthy(uuid))
            .count();
        if healthy == 0 {
            CheckResult::Unavailable
        } else if (healthy as u32) < replication_factor {
            CheckResult::UnderReplicated
        } else {
            CheckResult::Healthy
        }
    }

    fn is_server_healthy(&self, uuid: &str) -> bool {
        self.snapshot
            .servers
            .iter()
            .any(|s| s.uuid == uuid && s.is_healthy())
    }

    fn inspect(&self, filter: &TableFilter) -> InspectionResults {
        let tables: Vec<TableSummary> = self
            .snapshot
            .tables
            .iter()
            .filter(|t| filter.matches(&t.name))
            .cloned()
            .collect();

        let mut tablet_summaries = Vec::new();
        for tablet in &self.snapshot.tablets {
            let Some(table) = tables.iter().find(|t| t.id == tablet.table_id) else {
                continue;
            };
            let pending_dst = self.in_flight.get(&tablet.id).map(|m| &m.mv.ts_uuid_to);
            let replicas = tablet
                .replicas
                .iter()
                .enumerate()
                .map(|(i, uuid)| ReplicaSummary {
                    ts_uuid: uuid.clone(),
                    ts_address: Some(format!("{}:7050", uuid)),
                    ts_healthy: self.is_server_healthy(uuid),
                    is_leader: i == 0,
                    is_voter: pending_dst != Some(uuid),
                })
                .collect();
            tablet_summaries.push(TabletSummary {
                id: tablet.id.clone(),
                table_id: table.id.clone(),
                table_name: table.name.clone(),
                result: self.tablet_result(tablet, table.replication_factor),
                replicas,
                config_opid_idx: Some(tablet.config_opid_idx),
            });
        }

        InspectionResults {
            server_summaries: self.snapshot.servers.clone(),
            table_summaries: tables,
            tablet_summaries,
        }
    }
}

/// Simulated cluster
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    issued: AtomicU64,
    inspections: AtomicU64,
}

impl InMemoryCluster {
    /// Create a cluster where moves complete after one status poll
    pub fn new(snapshot: ClusterSnapshot) -> Self {
        Self {
            state: Mutex::new(ClusterState {
                snapshot,
                move_latency: 1,
                ..Default::default()
            }),
            issued: AtomicU64::new(0),
            inspections: AtomicU64::new(0),
        }
    }

    /// Number of status polls a move takes to complete
    pub fn with_move_latency(self, polls: u32) -> Self {
        self.state.lock().move_latency = polls.max(1);
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Keep every in-flight move from ever finishing
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    pub fn set_server_health(&self, uuid: &str, health: ServerHealth) {
        let mut state = self.state.lock();
        if let Some(server) = state.snapshot.servers.iter_mut().find(|s| s.uuid == uuid) {
            server.health = health;
        }
    }

    /// Reject every attempt to move a replica of the tablet
    pub fn reject_moves_of(&self, tablet_id: &str) {
        self.state.lock().reject_issue.insert(tablet_id.to_string());
    }

    /// Fail the next status poll of a move of the tablet
    pub fn fail_next_poll_of(&self, tablet_id: &str) {
        self.state.lock().poll_errors.insert(tablet_id.to_string());
    }

    /// Make the next move of the tablet end up failed
    pub fn fail_next_move_of(&self, tablet_id: &str) {
        self.state.lock().fail_moves.insert(tablet_id.to_string());
    }

    /// Change the tablet's Raft config behind the rebalancer's back
    pub fn bump_config(&self, tablet_id: &str) {
        if let Some(tablet) = self.state.lock().tablet_mut(tablet_id) {
            tablet.config_opid_idx += 1;
        }
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        self.state.lock().snapshot.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Highest number of moves any server took part in at the same time
    pub fn peak_moves_per_server(&self) -> usize {
        self.state
            .lock()
            .peak_moves_per_server
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.state.lock().completed
    }

    pub fn inspections(&self) -> u64 {
        self.inspections.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ClusterInspector for InMemoryCluster {
    async fn inspect(&self, filter: &TableFilter) -> Result<InspectionResults, InspectError> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(InspectError::Unreachable("simulated masters".to_string()));
        }
        self.inspections.fetch_add(1, Ordering::SeqCst);

        let tablets: Vec<String> = state.in_flight.keys().cloned().collect();
        for tablet_id in tablets {
            state.advance(&tablet_id);
        }
        Ok(state.inspect(filter))
    }
}

#[async_trait::async_trait]
impl MoveTransport for InMemoryCluster {
    async fn connect(&self, master_addresses: &[String]) -> Result<(), TransportError> {
        if self.state.lock().unreachable {
            return Err(TransportError::Unreachable(master_addresses.join(",")));
        }
        Ok(())
    }

    async fn issue_move(&self, mv: &ReplicaMove) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(TransportError::Unreachable("simulated masters".to_string()));
        }
        let rejected = |reason: &str| TransportError::Rejected {
            tablet_id: mv.tablet_id.clone(),
            reason: reason.to_string(),
        };
        if state.reject_issue.contains(&mv.tablet_id) {
            return Err(rejected("not the leader"));
        }
        if state.in_flight.contains_key(&mv.tablet_id) {
            return Err(rejected("Raft config change pending"));
        }

        let Some(tablet) = state.tablet_mut(&mv.tablet_id) else {
            return Err(TransportError::TabletNotFound(mv.tablet_id.clone()));
        };
        if let Some(expected) = mv.config_opid_idx {
            if expected != tablet.config_opid_idx {
                return Err(TransportError::StaleConfig {
                    tablet_id: mv.tablet_id.clone(),
                    expected,
                    actual: tablet.config_opid_idx,
                });
            }
        }
        if !tablet.replicas.contains(&mv.ts_uuid_from) {
            return Err(rejected("no replica at source"));
        }
        if tablet.replicas.contains(&mv.ts_uuid_to) {
            return Err(rejected("replica already at destination"));
        }
        tablet.replicas.push(mv.ts_uuid_to.clone());
        tablet.config_opid_idx += 1;

        state.start_move(mv);
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn poll_move(&self, mv: &ReplicaMove) -> Result<MoveStatus, TransportError> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(TransportError::Unreachable("simulated masters".to_string()));
        }
        if state.poll_errors.remove(&mv.tablet_id) {
            return Err(TransportError::LeaderUnavailable(mv.tablet_id.clone()));
        }

        state.advance(&mv.tablet_id);
        if let Some(status) = state.finished.remove(&mv.tablet_id) {
            return Ok(status);
        }
        if state.in_flight.contains_key(&mv.tablet_id) {
            return Ok(MoveStatus::InProgress);
        }
        Err(TransportError::TabletNotFound(mv.tablet_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn snapshot() -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::default();
        snapshot
            .add_server("ts-1")
            .add_server("ts-2")
            .add_server("ts-3")
            .add_table("orders", 2)
            .add_tablet("t1", "orders", &["ts-1", "ts-2"]);
        snapshot
    }

    #[tokio::test]
    async fn test_move_lifecycle() {
        let cluster = InMemoryCluster::new(snapshot()).with_move_latency(2);
        let mv = ReplicaMove::new("t1", "ts-1", "ts-3").with_config_opid_idx(1);

        cluster.issue_move(&mv).await.unwrap();
        assert_eq!(cluster.in_flight(), 1);
        assert_eq!(cluster.snapshot().tablets[0].replicas, vec!["ts-1", "ts-2", "ts-3"]);

        let results = cluster.inspect(&TableFilter::all()).await.unwrap();
        assert_eq!(results.tablet_summaries[0].result, CheckResult::Recovering);

        assert_eq!(cluster.poll_move(&mv).await.unwrap(), MoveStatus::Completed);
        assert_eq!(cluster.snapshot().tablets[0].replicas, vec!["ts-2", "ts-3"]);
        assert_eq!(cluster.snapshot().tablets[0].config_opid_idx, 3);
        assert_eq!(cluster.completed(), 1);
        assert_eq!(cluster.peak_moves_per_server(), 1);
    }

    #[tokio::test]
    async fn test_stale_config_rejected() {
        let cluster = InMemoryCluster::new(snapshot());
        cluster.bump_config("t1");

        let mv = ReplicaMove::new("t1", "ts-1", "ts-3").with_config_opid_idx(1);
        let err = cluster.issue_move(&mv).await.unwrap_err();
        assert!(matches!(err, TransportError::StaleConfig { expected: 1, actual: 2, .. }));
        assert_eq!(cluster.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_move_rolls_back() {
        let cluster = InMemoryCluster::new(snapshot());
        cluster.fail_next_move_of("t1");

        let mv = ReplicaMove::new("t1", "ts-1", "ts-3");
        cluster.issue_move(&mv).await.unwrap();
        assert!(matches!(cluster.poll_move(&mv).await.unwrap(), MoveStatus::Failed(_)));
        assert_eq!(cluster.snapshot().tablets[0].replicas, vec!["ts-1", "ts-2"]);
        assert_eq!(cluster.completed(), 0);
    }

    #[tokio::test]
    async fn test_inspection_filters_tables() {
        let mut snap = snapshot();
        snap.add_table("users", 2).add_tablet("t2", "users", &["ts-2", "ts-3"]);
        let cluster = InMemoryCluster::new(snap);

        let results = cluster
            .inspect(&TableFilter::new(["us*"]).unwrap())
            .await
            .unwrap();
        assert_eq!(results.table_summaries.len(), 1);
        assert_eq!(results.tablet_summaries.len(), 1);
        assert_eq!(results.tablet_summaries[0].id, "t2");
        assert!(results.tablet_summaries[0].replicas[0].is_leader);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let cluster = InMemoryCluster::new(snapshot());
        cluster.set_unreachable(true);
        assert!(cluster.inspect(&TableFilter::all()).await.is_err());
        assert!(cluster.connect(&["m1:7051".to_string()]).await.is_err());
    }

    #[test]
    fn test_load_json() {
        let json = r#"{
            "servers": [
                {"uuid": "ts-1", "address": "h1:7050", "health": "HEALTHY"},
                {"uuid": "ts-2", "address": "h2:7050", "health": "HEALTHY", "location": "/rack-a"}
            ],
            "tables": [
                {"id": "tbl-1", "name": "orders", "replication_factor": 1, "result": "HEALTHY"}
            ],
            "tablets": [
                {"id": "t1", "table_id": "tbl-1", "replicas": ["ts-1"]}
            ]
        }"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let snapshot = ClusterSnapshot::load_json(file.path()).unwrap();
        assert_eq!(snapshot.servers.len(), 2);
        assert_eq!(snapshot.servers[1].location.as_deref(), Some("/rack-a"));
        assert_eq!(snapshot.tablets[0].config_opid_idx, 1);
        assert_eq!(snapshot.replicas_per_server()["ts-2"], 0);
    }

    #[test]
    fn test_load_json_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(
            ClusterSnapshot::load_json(file.path()),
            Err(SnapshotError::Parse(_))
        ));
    }
}
