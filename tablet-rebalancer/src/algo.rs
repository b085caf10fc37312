//! Placement algorithm
//!
//! Proposes table-level replica moves for a cluster balance model. The
//! algorithm never talks to the cluster: it only reads [`ClusterInfo`] and
//! simulates its own moves on a private copy.
//!
//! [`TwoDimensionalGreedyAlgo`] balances along two dimensions at once:
//! - the replica count of every table across tablet servers (table skew)
//! - the total replica count across tablet servers (cluster skew)
//!
//! Table skew has priority. Once every table has skew of at most 1, moves are
//! only made if they keep it that way and reduce the cluster skew.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tablet_core::TableReplicaMove;
use thiserror::Error;
use tracing::debug;

use crate::cluster_info::{ClusterBalanceInfo, ClusterInfo, TableBalanceInfo};

/// Algorithm errors
#[derive(Error, Debug, Clone)]
pub enum AlgoError {
    #[error("No tablet servers available")]
    NoServers,

    #[error("Invalid model: {0}")]
    InvalidModel(String),
}

/// A placement algorithm proposing table-level replica moves
pub trait RebalancingAlgo: Send {
    /// Find the next move for the given model, `None` if the model is balanced
    fn get_next_move(&mut self, info: &ClusterInfo) -> Result<Option<TableReplicaMove>, AlgoError>;

    /// Update the model as if the move had been carried out
    fn apply_move(&self, info: &mut ClusterInfo, mv: &TableReplicaMove) -> Result<(), AlgoError> {
        info.balance.apply_move(mv)
    }

    /// Propose up to `max_moves` moves, each one computed against the model
    /// with all the previous ones applied.
    fn get_next_moves(
        &mut self,
        info: &ClusterInfo,
        max_moves: usize,
    ) -> Result<Vec<TableReplicaMove>, AlgoError> {
        let mut info = info.clone();
        let mut moves = Vec::new();
        while moves.len() < max_moves {
            let Some(mv) = self.get_next_move(&info)? else {
                break;
            };
            self.apply_move(&mut info, &mv)?;
            moves.push(mv);
        }
        Ok(moves)
    }
}

/// How to choose among candidates which are equally good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EqualSkewOption {
    /// First one in tablet server / table id order
    PickFirst,
    #[default]
    PickRandom,
}

pub struct TwoDimensionalGreedyAlgo {
    equal_skew_opt: EqualSkewOption,
    rng: StdRng,
}

impl TwoDimensionalGreedyAlgo {
    pub fn new(equal_skew_opt: EqualSkewOption) -> Self {
        Self {
            equal_skew_opt,
            rng: StdRng::from_entropy(),
        }
    }

    fn pick<'a, T>(&mut self, candidates: &'a [T]) -> Option<&'a T> {
        match self.equal_skew_opt {
            EqualSkewOption::PickFirst => candidates.first(),
            EqualSkewOption::PickRandom => candidates.choose(&mut self.rng),
        }
    }

    /// Among the servers where the table has `count` replicas, pick one with
    /// the highest (`most_loaded`) or lowest total replica count.
    fn pick_server(
        &mut self,
        table: &TableBalanceInfo,
        balance: &ClusterBalanceInfo,
        count: i32,
        most_loaded: bool,
    ) -> Option<String> {
        let servers: Vec<&str> = table.servers_with_count(count).collect();
        let totals = servers.iter().map(|uuid| balance.total_count(uuid));
        let target = if most_loaded { totals.max() } else { totals.min() };
        let target = target?;
        let candidates: Vec<&str> = servers
            .into_iter()
            .filter(|uuid| balance.total_count(uuid) == target)
            .collect();
        self.pick(&candidates).map(|uuid| uuid.to_string())
    }

    /// The best move for a single table: from its most loaded server with the
    /// highest total to its least loaded server with the lowest total.
    /// Returns the move along with how much higher the source's total is.
    fn table_move(
        &mut self,
        table: &TableBalanceInfo,
        balance: &ClusterBalanceInfo,
    ) -> Option<(i32, TableReplicaMove)> {
        let from = self.pick_server(table, balance, table.max_count(), true)?;
        let to = self.pick_server(table, balance, table.min_count(), false)?;
        let gain = balance.total_count(&from) - balance.total_count(&to);
        Some((
            gain,
            TableReplicaMove {
                table_id: table.table_id.clone(),
                from,
                to,
            },
        ))
    }
}

impl Default for TwoDimensionalGreedyAlgo {
    fn default() -> Self {
        Self::new(EqualSkewOption::default())
    }
}

impl RebalancingAlgo for TwoDimensionalGreedyAlgo {
    fn get_next_move(&mut self, info: &ClusterInfo) -> Result<Option<TableReplicaMove>, AlgoError> {
        let balance = &info.balance;
        if balance.tables.is_empty() {
            return Ok(None);
        }
        if balance.replicas_by_server.is_empty() {
            return Err(AlgoError::NoServers);
        }

        let max_table_skew = balance.max_table_skew();
        let cluster_skew = balance.cluster_skew();
        if max_table_skew <= 1 && cluster_skew <= 1 {
            return Ok(None);
        }

        // With unbalanced tables, only the most skewed ones are considered.
        // Otherwise any table with skew 1 can swap its extra replica over to
        // a server with fewer replicas in total.
        let wanted_skew = max_table_skew.max(1);
        let mut candidates = Vec::new();
        for table in balance.tables.values().filter(|t| t.skew() == wanted_skew) {
            if let Some(candidate) = self.table_move(table, balance) {
                candidates.push(candidate);
            }
        }
        if max_table_skew <= 1 {
            candidates.retain(|(gain, _)| *gain >= 2);
        }

        let Some(best_gain) = candidates.iter().map(|(gain, _)| *gain).max() else {
            return Ok(None);
        };
        let best: Vec<TableReplicaMove> = candidates
            .into_iter()
            .filter(|(gain, _)| *gain == best_gain)
            .map(|(_, mv)| mv)
            .collect();

        let mv = self.pick(&best).cloned();
        if let Some(mv) = &mv {
            debug!(
                table = %mv.table_id,
                from = %mv.from,
                to = %mv.to,
                max_table_skew,
                cluster_skew,
                "Proposed table replica move"
            );
        }
        Ok(mv)
    }
}
