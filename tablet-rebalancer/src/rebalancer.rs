//! Rebalancing control loop
//!
//! Drives a [`Runner`] through refresh, schedule and poll cycles until the
//! cluster is balanced or the run times out:
//! 1. Inspect the cluster and compute a batch of moves
//! 2. Schedule moves from the batch as long as servers have capacity
//! 3. Poll in-flight moves, go back to 2 while any of them are pending
//! 4. Start over with a fresh inspection

use std::sync::Arc;
use std::time::Duration;
use tablet_core::TableReplicaMove;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::algo::{RebalancingAlgo, TwoDimensionalGreedyAlgo};
use crate::algo_runner::TwoDimensionalGreedyRunner;
use crate::cluster_info::ClusterInfo;
use crate::config::RebalancerConfig;
use crate::error::{RebalanceError, Result};
use crate::inspector::{fetch_cluster_raw_info, ClusterInspector, ClusterRawInfo};
use crate::runner::Runner;
use crate::transport::MoveTransport;

/// Terminal status of a rebalancing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Unknown,
    ClusterIsBalanced,
    TimedOut,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Unknown => write!(f, "unknown"),
            RunStatus::ClusterIsBalanced => write!(f, "cluster is balanced"),
            RunStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

pub struct Rebalancer {
    config: RebalancerConfig,
    inspector: Arc<dyn ClusterInspector>,
    transport: Arc<dyn MoveTransport>,
}

impl Rebalancer {
    pub fn new(
        config: RebalancerConfig,
        inspector: Arc<dyn ClusterInspector>,
        transport: Arc<dyn MoveTransport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inspector,
            transport,
        })
    }

    pub fn config(&self) -> &RebalancerConfig {
        &self.config
    }

    /// Rebalance the cluster with the two-dimensional greedy runner.
    ///
    /// Returns the terminal status along with the number of completed moves.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(RunStatus, u32)> {
        let deadline = self.config.max_run_time().map(|d| Instant::now() + d);
        let mut runner = TwoDimensionalGreedyRunner::two_dimensional_greedy(
            &self.config,
            self.inspector.clone(),
            self.transport.clone(),
            deadline,
        )?;
        runner.init(&self.config.master_addresses).await?;

        let status = self.run_with(&mut runner).await?;
        let moves_count = runner.moves_count();
        info!(status = %status, moves = moves_count, "Rebalancing finished");
        Ok((status, moves_count))
    }

    /// Run the control loop with the given runner
    pub async fn run_with(&self, runner: &mut dyn Runner) -> Result<RunStatus> {
        let deadline = runner.deadline();
        let max_staleness = self.config.max_staleness_interval();
        let poll_interval = self.config.poll_interval();

        let mut staleness_start = Instant::now();
        let mut resync_state = false;
        let mut is_timed_out = false;
        let mut cycles: u64 = 0;

        'cycles: loop {
            if is_past(deadline) {
                is_timed_out = true;
                break;
            }
            if resync_state {
                info!("Re-synchronizing with the cluster state");
                runner.reset_moves_in_progress();
                resync_state = false;
            }
            check_staleness(staleness_start, max_staleness)?;

            cycles += 1;
            if !runner.get_next_moves().await? {
                debug!(cycles, "No moves to make");
                break;
            }

            let mut has_progress = false;
            loop {
                loop {
                    let outcome = runner.schedule_next_move().await;
                    if outcome.timed_out {
                        is_timed_out = true;
                        break 'cycles;
                    }
                    if let Some(e) = outcome.connectivity_error {
                        return Err(RebalanceError::Connectivity(e));
                    }
                    if outcome.must_reset {
                        resync_state = true;
                        continue 'cycles;
                    }
                    if outcome.scheduled {
                        staleness_start = Instant::now();
                        has_progress = true;
                        continue;
                    }
                    // A rejected move is dropped; try the rest of the batch.
                    if outcome.has_errors {
                        continue;
                    }
                    break;
                }

                // Nothing in flight and nothing left to schedule: the batch is done.
                if runner.scheduled_moves().is_empty() {
                    if !has_progress {
                        tokio::time::sleep(bounded_by(poll_interval, deadline)).await;
                    }
                    break;
                }

                let outcome = runner.update_moves_in_progress_status().await;
                if outcome.has_updates {
                    staleness_start = Instant::now();
                    has_progress = true;
                }
                if outcome.timed_out {
                    is_timed_out = true;
                    break 'cycles;
                }
                if let Some(e) = outcome.connectivity_error {
                    return Err(RebalanceError::Connectivity(e));
                }
                if outcome.must_reset {
                    resync_state = true;
                    break;
                }
                if outcome.has_pending_moves {
                    if !outcome.has_updates {
                        check_staleness(staleness_start, max_staleness)?;
                    }
                    tokio::time::sleep(bounded_by(poll_interval, deadline)).await;
                }
            }
        }

        if is_timed_out {
            if !runner.scheduled_moves().is_empty() {
                let outcome = runner.reap_moves_in_progress().await;
                info!(
                    in_flight = runner.scheduled_moves().len(),
                    has_errors = outcome.has_errors,
                    "Reaped moves in progress"
                );
            }
            warn!(cycles, "Maximum run time reached");
            return Ok(RunStatus::TimedOut);
        }
        Ok(RunStatus::ClusterIsBalanced)
    }

    /// Inspect the cluster through the configured table filter and location
    pub async fn get_cluster_raw_info(&self) -> Result<ClusterRawInfo> {
        let raw_info = fetch_cluster_raw_info(
            self.inspector.as_ref(),
            &self.config.table_filter()?,
            self.config.location.as_deref(),
        )
        .await?;
        Ok(raw_info)
    }

    /// Table-level moves the greedy algorithm would make for the model,
    /// without touching the cluster
    pub fn get_next_moves(
        &self,
        info: &ClusterInfo,
        max_moves: usize,
    ) -> Result<Vec<TableReplicaMove>> {
        let mut algo = TwoDimensionalGreedyAlgo::default();
        Ok(algo.get_next_moves(info, max_moves)?)
    }
}

fn is_past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn bounded_by(interval: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(d) => interval.min(d.saturating_duration_since(Instant::now())),
        None => interval,
    }
}

fn check_staleness(staleness_start: Instant, max_staleness: Duration) -> Result<()> {
    let stale_for = staleness_start.elapsed();
    if stale_for > max_staleness {
        warn!(stale_for = ?stale_for, "No moves scheduled or completed");
        return Err(RebalanceError::Stalled(max_staleness));
    }
    Ok(())
}
