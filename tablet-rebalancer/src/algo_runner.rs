//! Algorithm-driven runner
//!
//! [`AlgoBasedRunner`] gets its moves from a [`RebalancingAlgo`]: it turns the
//! proposed table-level moves into concrete replica moves and schedules them
//! so that no tablet server takes part in more than `max_moves_per_server`
//! moves at a time.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tablet_core::{MovesInProgress, ReplicaMove, TableFilter};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::algo::{RebalancingAlgo, TwoDimensionalGreedyAlgo};
use crate::cluster_info::{build_cluster_info, ClusterInfo};
use crate::config::RebalancerConfig;
use crate::error::{RebalanceError, Result};
use crate::inspector::{fetch_cluster_raw_info, ClusterInspector};
use crate::replicas::find_replicas;
use crate::runner::{BaseRunner, PollOutcome, Runner, ScheduleOutcome};
use crate::transport::{MoveTransport, TransportError};

/// How many batches worth of moves to ask the algorithm for at once
const MOVES_PER_SERVER_FACTOR: usize = 5;

pub struct AlgoBasedRunner<A: RebalancingAlgo> {
    base: BaseRunner,
    algorithm: A,
    inspector: Arc<dyn ClusterInspector>,
    table_filter: TableFilter,
    location: Option<String>,
    move_rf1_replicas: bool,
    output_replica_distribution_details: bool,

    /// Moves to schedule
    replica_moves: Vec<ReplicaMove>,
    /// Indices into `replica_moves` of pending moves, by source server
    src_op_indices: HashMap<String, BTreeSet<usize>>,
    /// Indices into `replica_moves` of pending moves, by destination server
    dst_op_indices: HashMap<String, BTreeSet<usize>>,
    rng: StdRng,
}

/// Runner balancing both per-table and per-server replica counts
pub type TwoDimensionalGreedyRunner = AlgoBasedRunner<TwoDimensionalGreedyAlgo>;

impl TwoDimensionalGreedyRunner {
    pub fn two_dimensional_greedy(
        config: &RebalancerConfig,
        inspector: Arc<dyn ClusterInspector>,
        transport: Arc<dyn MoveTransport>,
        deadline: Option<Instant>,
    ) -> Result<Self> {
        Self::new(
            TwoDimensionalGreedyAlgo::default(),
            config,
            inspector,
            transport,
            deadline,
        )
    }
}

impl<A: RebalancingAlgo> AlgoBasedRunner<A> {
    pub fn new(
        algorithm: A,
        config: &RebalancerConfig,
        inspector: Arc<dyn ClusterInspector>,
        transport: Arc<dyn MoveTransport>,
        deadline: Option<Instant>,
    ) -> Result<Self> {
        Ok(Self {
            base: BaseRunner::new(
                transport,
                config.max_moves_per_server,
                deadline,
                config.rpc_timeout(),
            ),
            algorithm,
            inspector,
            table_filter: config.table_filter()?,
            location: config.location.clone(),
            move_rf1_replicas: config.move_rf1_replicas,
            output_replica_distribution_details: config.output_replica_distribution_details,
            replica_moves: Vec::new(),
            src_op_indices: HashMap::new(),
            dst_op_indices: HashMap::new(),
            rng: StdRng::from_entropy(),
        })
    }

    /// Use a fixed seed for choosing among eligible moves
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Moves of the current batch not scheduled yet
    pub fn pending_moves(&self) -> usize {
        self.src_op_indices.values().map(BTreeSet::len).sum()
    }

    /// Pick a pending move whose source and destination servers both have
    /// room for one more move. Candidates are chosen uniformly at random.
    fn find_next_move(&mut self) -> Option<usize> {
        let cap = self.base.max_moves_per_server;
        let mut candidates = Vec::new();
        for uuid in self.base.op_counts.servers_below(cap) {
            let Some(indices) = self.src_op_indices.get(uuid) else {
                continue;
            };
            for &idx in indices {
                let dst = &self.replica_moves[idx].ts_uuid_to;
                if self.base.op_counts.count(dst) < cap {
                    candidates.push(idx);
                }
            }
        }
        candidates.choose(&mut self.rng).copied()
    }

    fn update_on_move_scheduled(&mut self, idx: usize, mv: &ReplicaMove, is_success: bool) {
        if is_success {
            debug_assert!(!self.base.scheduled_moves.contains_key(&mv.tablet_id));
            self.base
                .scheduled_moves
                .insert(mv.tablet_id.clone(), mv.clone());
            self.base.op_counts.increment(&mv.ts_uuid_from);
            self.base.op_counts.increment(&mv.ts_uuid_to);
            debug_assert!(self.base.op_counts.is_consistent());
        }
        remove_index(&mut self.src_op_indices, &mv.ts_uuid_from, idx);
        remove_index(&mut self.dst_op_indices, &mv.ts_uuid_to, idx);
    }

    fn log_distribution(info: &ClusterInfo) {
        for table in info.balance.tables.values() {
            debug!(
                table = %table.table_id,
                skew = table.skew(),
                replicas = ?table.replicas_by_server,
                "Table replica distribution"
            );
        }
        debug!(replicas = ?info.balance.replicas_by_server, "Total replica distribution");
    }
}

fn remove_index(indices: &mut HashMap<String, BTreeSet<usize>>, ts_uuid: &str, idx: usize) {
    if let Some(set) = indices.get_mut(ts_uuid) {
        set.remove(&idx);
        if set.is_empty() {
            indices.remove(ts_uuid);
        }
    }
}

#[async_trait::async_trait]
impl<A: RebalancingAlgo> Runner for AlgoBasedRunner<A> {
    async fn init(&mut self, master_addresses: &[String]) -> Result<()> {
        self.base.init(master_addresses).await
    }

    fn load_moves(&mut self, replica_moves: Vec<ReplicaMove>) {
        self.replica_moves = replica_moves;
        self.src_op_indices.clear();
        self.dst_op_indices.clear();

        // Counters restart from what is actually in flight.
        self.base.op_counts.rebuild(&self.base.scheduled_moves);

        for (idx, mv) in self.replica_moves.iter().enumerate() {
            self.src_op_indices
                .entry(mv.ts_uuid_from.clone())
                .or_default()
                .insert(idx);
            self.dst_op_indices
                .entry(mv.ts_uuid_to.clone())
                .or_default()
                .insert(idx);
            self.base.op_counts.ensure(&mv.ts_uuid_from);
            self.base.op_counts.ensure(&mv.ts_uuid_to);
        }
        debug!(moves = self.replica_moves.len(), "Loaded replica moves");
    }

    async fn schedule_next_move(&mut self) -> ScheduleOutcome {
        let mut outcome = ScheduleOutcome::default();
        if self.base.is_past_deadline() {
            outcome.timed_out = true;
            return outcome;
        }

        let Some(idx) = self.find_next_move() else {
            return outcome;
        };
        let mv = self.replica_moves[idx].clone();

        match self.base.issue_move(&mv).await {
            Ok(()) => {
                self.update_on_move_scheduled(idx, &mv, true);
                outcome.scheduled = true;
                info!(
                    tablet = %mv.tablet_id,
                    src = %mv.ts_uuid_from,
                    dst = %mv.ts_uuid_to,
                    "Move scheduled"
                );
            }
            Err(e @ TransportError::Unreachable(_)) => {
                warn!(tablet = %mv.tablet_id, error = %e, "Cluster unreachable while scheduling move");
                outcome.connectivity_error = Some(e);
            }
            Err(TransportError::Timeout) => {
                // The request may have reached the cluster even though no
                // answer came back, so the move cannot be tracked.
                self.update_on_move_scheduled(idx, &mv, false);
                outcome.has_errors = true;
                outcome.must_reset = true;
                warn!(
                    tablet = %mv.tablet_id,
                    src = %mv.ts_uuid_from,
                    dst = %mv.ts_uuid_to,
                    "Move request timed out, state unknown"
                );
            }
            Err(e) => {
                self.update_on_move_scheduled(idx, &mv, false);
                outcome.has_errors = true;
                warn!(
                    tablet = %mv.tablet_id,
                    src = %mv.ts_uuid_from,
                    dst = %mv.ts_uuid_to,
                    error = %e,
                    "Move rejected"
                );
            }
        }
        if self.base.is_past_deadline() {
            outcome.timed_out = true;
        }
        outcome
    }

    async fn update_moves_in_progress_status(&mut self) -> PollOutcome {
        self.base.poll_moves(true).await
    }

    async fn reap_moves_in_progress(&mut self) -> PollOutcome {
        self.base.poll_moves(false).await
    }

    fn reset_moves_in_progress(&mut self) {
        self.base.reset();
        self.replica_moves.clear();
        self.src_op_indices.clear();
        self.dst_op_indices.clear();
    }

    #[instrument(skip(self))]
    async fn get_next_moves_impl(&mut self) -> Result<Vec<ReplicaMove>> {
        let raw_info = fetch_cluster_raw_info(
            self.inspector.as_ref(),
            &self.table_filter,
            self.location.as_deref(),
        )
        .await?;

        // Moving replicas around while the cluster re-replicates on its own
        // would only get in the way.
        if let Some(s) = raw_info.server_summaries.iter().find(|s| !s.is_healthy()) {
            return Err(RebalanceError::UnhealthyServer {
                uuid: s.uuid.clone(),
                address: s.address.clone(),
                health: s.health,
            });
        }

        let cluster_info = build_cluster_info(
            &raw_info,
            &self.base.scheduled_moves,
            self.move_rf1_replicas,
        )?;
        debug!(summary = %cluster_info.balance.summary(), "Built cluster balance model");
        if self.output_replica_distribution_details {
            Self::log_distribution(&cluster_info);
        }

        let max_moves = self.base.max_moves_per_server
            * cluster_info.balance.replicas_by_server.len()
            * MOVES_PER_SERVER_FACTOR;
        let table_moves = self.algorithm.get_next_moves(&cluster_info, max_moves)?;
        if table_moves.is_empty() {
            return Ok(Vec::new());
        }

        let mut tablets_in_move: HashSet<String> =
            self.base.scheduled_moves.keys().cloned().collect();
        let mut replica_moves = Vec::with_capacity(table_moves.len());
        for mv in &table_moves {
            let mut candidates = find_replicas(mv, &raw_info, self.move_rf1_replicas);
            candidates.shuffle(&mut self.rng);
            let Some(tablet) = candidates
                .into_iter()
                .find(|t| !tablets_in_move.contains(&t.id))
            else {
                warn!(
                    table = %mv.table_id,
                    src = %mv.from,
                    dst = %mv.to,
                    "Could not find any suitable replica to move"
                );
                continue;
            };
            tablets_in_move.insert(tablet.id.clone());
            let mut replica_move = ReplicaMove::new(&tablet.id, &mv.from, &mv.to);
            replica_move.config_opid_idx = tablet.config_opid_idx;
            replica_moves.push(replica_move);
        }

        info!(
            proposed = table_moves.len(),
            resolved = replica_moves.len(),
            "Computed next replica moves"
        );
        Ok(replica_moves)
    }

    fn scheduled_moves(&self) -> &MovesInProgress {
        self.base.scheduled_moves()
    }

    fn deadline(&self) -> Option<Instant> {
        self.base.deadline()
    }

    fn moves_count(&self) -> u32 {
        self.base.moves_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::InspectError;
    use crate::transport::MoveStatus;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tablet_core::InspectionResults;

    struct NoopInspector;

    #[async_trait::async_trait]
    impl ClusterInspector for NoopInspector {
        async fn inspect(
            &self,
            _filter: &TableFilter,
        ) -> std::result::Result<InspectionResults, InspectError> {
            Ok(InspectionResults::default())
        }
    }

    /// Accepts every move except those for tablets listed in `reject`.
    /// With `hang`, move requests never get an answer.
    #[derive(Default)]
    struct RecordingTransport {
        reject: Vec<String>,
        hang: bool,
        issued: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl MoveTransport for RecordingTransport {
        async fn connect(&self, _master_addresses: &[String]) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn issue_move(&self, mv: &ReplicaMove) -> std::result::Result<(), TransportError> {
            if self.reject.contains(&mv.tablet_id) {
                return Err(TransportError::Rejected {
                    tablet_id: mv.tablet_id.clone(),
                    reason: "not the leader".to_string(),
                });
            }
            self.issued.lock().push(mv.tablet_id.clone());
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn poll_move(&self, _mv: &ReplicaMove) -> std::result::Result<MoveStatus, TransportError> {
            Ok(MoveStatus::InProgress)
        }
    }

    fn runner(transport: Arc<RecordingTransport>, max_moves_per_server: usize) -> TwoDimensionalGreedyRunner {
        let config = RebalancerConfig {
            max_moves_per_server,
            rpc_timeout_secs: 5,
            ..Default::default()
        };
        TwoDimensionalGreedyRunner::two_dimensional_greedy(
            &config,
            Arc::new(NoopInspector),
            transport,
            None,
        )
        .unwrap()
        .with_seed(7)
    }

    #[tokio::test]
    async fn test_schedules_within_cap() {
        let transport = Arc::new(RecordingTransport::default());
        let mut runner = runner(transport.clone(), 1);
        runner.load_moves(vec![
            ReplicaMove::new("t1", "ts-1", "ts-2"),
            ReplicaMove::new("t2", "ts-1", "ts-3"),
            ReplicaMove::new("t3", "ts-4", "ts-5"),
        ]);
        assert_eq!(runner.pending_moves(), 3);

        let mut scheduled = 0;
        loop {
            let outcome = runner.schedule_next_move().await;
            if !outcome.scheduled {
                break;
            }
            scheduled += 1;
        }

        // ts-1 takes part in a single move at a time
        assert_eq!(scheduled, 2);
        assert_eq!(runner.scheduled_moves().len(), 2);
        assert!(runner.scheduled_moves().contains_key("t3"));
        assert_eq!(runner.pending_moves(), 1);
        assert_eq!(runner.base.op_counts.max_count(), 1);
        assert!(runner.base.op_counts.is_consistent());
    }

    #[tokio::test]
    async fn test_rejected_move_leaves_counters_alone() {
        let transport = Arc::new(RecordingTransport {
            reject: vec!["t1".to_string()],
            ..Default::default()
        });
        let mut runner = runner(transport.clone(), 2);
        runner.load_moves(vec![ReplicaMove::new("t1", "ts-1", "ts-2")]);

        let outcome = runner.schedule_next_move().await;
        assert!(!outcome.scheduled);
        assert!(outcome.has_errors);
        assert!(runner.scheduled_moves().is_empty());
        assert_eq!(runner.base.op_counts.count("ts-1"), 0);
        assert_eq!(runner.pending_moves(), 0);

        let outcome = runner.schedule_next_move().await;
        assert_eq!(outcome, ScheduleOutcome::default());
    }

    #[tokio::test]
    async fn test_load_moves_keeps_in_flight_counts() {
        let transport = Arc::new(RecordingTransport::default());
        let mut runner = runner(transport, 1);
        runner.load_moves(vec![ReplicaMove::new("t1", "ts-1", "ts-2")]);
        assert!(runner.schedule_next_move().await.scheduled);

        runner.load_moves(vec![ReplicaMove::new("t2", "ts-2", "ts-3")]);
        assert_eq!(runner.base.op_counts.count("ts-2"), 1);
        assert!(!runner.schedule_next_move().await.scheduled);

        runner.reset_moves_in_progress();
        assert!(runner.scheduled_moves().is_empty());
        assert_eq!(runner.pending_moves(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_scheduling_past_deadline() {
        let transport = Arc::new(RecordingTransport::default());
        let config = RebalancerConfig::default();
        let mut runner = TwoDimensionalGreedyRunner::two_dimensional_greedy(
            &config,
            Arc::new(NoopInspector),
            transport.clone(),
            Some(Instant::now() + Duration::from_secs(1)),
        )
        .unwrap();
        runner.load_moves(vec![ReplicaMove::new("t1", "ts-1", "ts-2")]);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let outcome = runner.schedule_next_move().await;
        assert!(outcome.timed_out);
        assert!(!outcome.scheduled);
        assert!(transport.issued.lock().is_empty());
    }

    #[tokio::test]
    async fn test_picks_uniformly_among_eligible_moves() {
        let transport = Arc::new(RecordingTransport::default());
        let mut runner = runner(transport.clone(), 1);
        let moves: Vec<ReplicaMove> = (0..4)
            .map(|i| ReplicaMove::new(format!("t{}", i), format!("src-{}", i), format!("dst-{}", i)))
            .collect();

        let rounds = 200;
        let mut picks: HashMap<String, usize> = HashMap::new();
        for _ in 0..rounds {
            runner.load_moves(moves.clone());
            assert!(runner.schedule_next_move().await.scheduled);
            let (tablet_id, _) = runner.scheduled_moves().iter().next().unwrap();
            *picks.entry(tablet_id.clone()).or_default() += 1;
            runner.reset_moves_in_progress();
        }

        // Each move is expected 50 times; 20 is about five deviations below.
        assert_eq!(picks.len(), moves.len());
        for mv in &moves {
            let count = picks.get(&mv.tablet_id).copied().unwrap_or(0);
            assert!(count >= 20, "{} picked {} times: {:?}", mv.tablet_id, count, picks);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_move_request_forces_reset() {
        let transport = Arc::new(RecordingTransport {
            hang: true,
            ..Default::default()
        });
        let mut runner = runner(transport.clone(), 2);
        runner.load_moves(vec![ReplicaMove::new("t1", "ts-1", "ts-2")]);

        let outcome = runner.schedule_next_move().await;
        assert!(!outcome.scheduled);
        assert!(outcome.has_errors);
        assert!(outcome.must_reset);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.connectivity_error, None);
        assert_eq!(transport.issued.lock().len(), 1);
        assert!(runner.scheduled_moves().is_empty());
        assert_eq!(runner.pending_moves(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_on_schedule() {
        struct UnreachableTransport;

        #[async_trait::async_trait]
        impl MoveTransport for UnreachableTransport {
            async fn connect(&self, _master_addresses: &[String]) -> std::result::Result<(), TransportError> {
                Ok(())
            }

            async fn issue_move(&self, _mv: &ReplicaMove) -> std::result::Result<(), TransportError> {
                Err(TransportError::Unreachable("m1:7051".to_string()))
            }

            async fn poll_move(&self, _mv: &ReplicaMove) -> std::result::Result<MoveStatus, TransportError> {
                Err(TransportError::Unreachable("m1:7051".to_string()))
            }
        }

        let config = RebalancerConfig::default();
        let mut runner = TwoDimensionalGreedyRunner::two_dimensional_greedy(
            &config,
            Arc::new(NoopInspector),
            Arc::new(UnreachableTransport),
            None,
        )
        .unwrap();
        runner.load_moves(vec![ReplicaMove::new("t1", "ts-1", "ts-2")]);

        let outcome = runner.schedule_next_move().await;
        assert!(!outcome.scheduled);
        assert!(matches!(
            outcome.connectivity_error,
            Some(TransportError::Unreachable(_))
        ));
        assert!(runner.scheduled_moves().is_empty());
    }

    #[test]
    fn test_invalid_table_filter_rejected() {
        let config = RebalancerConfig {
            table_filters: vec!["orders_[".to_string()],
            ..Default::default()
        };
        let result = TwoDimensionalGreedyRunner::two_dimensional_greedy(
            &config,
            Arc::new(NoopInspector),
            Arc::new(RecordingTransport::default()),
            None,
        );
        assert!(matches!(result, Err(RebalanceError::Config(_))));
    }

    #[tokio::test]
    async fn test_empty_cluster_has_no_moves() {
        let transport = Arc::new(RecordingTransport::default());
        let mut runner = runner(transport, 2);
        assert!(runner.get_next_moves_impl().await.unwrap().is_empty());
        assert!(!runner.get_next_moves().await.unwrap());
    }
}
