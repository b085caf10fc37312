//! Move scheduling
//!
//! A [`Runner`] owns the bookkeeping of a rebalancing run:
//! - the batch of moves waiting to be scheduled
//! - the moves scheduled and still in flight
//! - the number of in-flight moves per tablet server
//!
//! [`BaseRunner`] holds the state shared by all runners and knows how to
//! track in-flight moves through the transport. Deciding which moves to run
//! is left to the concrete runner.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tablet_core::{MovesInProgress, ReplicaMove};
use tokio::time::{timeout, Instant};
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::replicas::filter_moves;
use crate::transport::{MoveStatus, MoveTransport, TransportError};

/// Result of one [`Runner::schedule_next_move`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// A move was started
    pub scheduled: bool,
    /// A candidate move was rejected and dropped from the batch
    pub has_errors: bool,
    pub timed_out: bool,
    /// The cluster may have started a move it never confirmed
    pub must_reset: bool,
    /// The cluster could not be reached at all
    pub connectivity_error: Option<TransportError>,
}

/// Result of one [`Runner::update_moves_in_progress_status`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// At least one in-flight move completed or failed
    pub has_updates: bool,
    /// The status of at least one move could not be obtained
    pub has_errors: bool,
    pub timed_out: bool,
    /// In-progress state is no longer reliable and must be discarded
    pub must_reset: bool,
    /// Moves are still in flight after this poll
    pub has_pending_moves: bool,
    /// The cluster could not be reached at all
    pub connectivity_error: Option<TransportError>,
}

/// Finds and schedules replica moves and tracks the scheduled ones
#[async_trait::async_trait]
pub trait Runner: Send {
    /// Connect to the cluster with the given master endpoints
    async fn init(&mut self, master_addresses: &[String]) -> Result<()>;

    /// Replace the batch of moves to schedule
    fn load_moves(&mut self, replica_moves: Vec<ReplicaMove>);

    /// Schedule at most one move from the loaded batch
    async fn schedule_next_move(&mut self) -> ScheduleOutcome;

    /// Poll the status of every in-flight move and update the bookkeeping
    async fn update_moves_in_progress_status(&mut self) -> PollOutcome;

    /// Poll in-flight moves once more without regard to the deadline
    async fn reap_moves_in_progress(&mut self) -> PollOutcome;

    /// Forget about all in-flight moves
    fn reset_moves_in_progress(&mut self);

    /// Compute a new batch of moves against the current cluster state.
    /// Moves already in progress are taken into account.
    async fn get_next_moves_impl(&mut self) -> Result<Vec<ReplicaMove>>;

    fn scheduled_moves(&self) -> &MovesInProgress;

    /// Point in time after which no new moves are scheduled
    fn deadline(&self) -> Option<Instant>;

    /// Number of moves completed successfully so far
    fn moves_count(&self) -> u32;

    /// Load the next batch of moves.
    ///
    /// Returns `false` only when there is nothing left to do: no new moves
    /// and none in flight.
    async fn get_next_moves(&mut self) -> Result<bool> {
        let mut replica_moves = self.get_next_moves_impl().await?;
        if replica_moves.is_empty() && self.scheduled_moves().is_empty() {
            return Ok(false);
        }

        // A tablet never gets a second move while one is still in flight.
        filter_moves(self.scheduled_moves(), &mut replica_moves);
        self.load_moves(replica_moves);
        Ok(true)
    }
}

/// Number of in-flight moves per tablet server, indexed both ways
#[derive(Debug, Default)]
pub struct OpCounters {
    count_per_server: HashMap<String, usize>,
    servers_by_count: BTreeMap<usize, BTreeSet<String>>,
}

impl OpCounters {
    pub fn count(&self, ts_uuid: &str) -> usize {
        self.count_per_server.get(ts_uuid).copied().unwrap_or(0)
    }

    /// Start tracking a server with no moves, unless it is already tracked
    pub fn ensure(&mut self, ts_uuid: &str) {
        if !self.count_per_server.contains_key(ts_uuid) {
            self.count_per_server.insert(ts_uuid.to_string(), 0);
            self.servers_by_count
                .entry(0)
                .or_default()
                .insert(ts_uuid.to_string());
        }
    }

    pub fn increment(&mut self, ts_uuid: &str) {
        self.ensure(ts_uuid);
        let count = self.count(ts_uuid);
        self.set(ts_uuid, count, count + 1);
    }

    pub fn decrement(&mut self, ts_uuid: &str) {
        let count = self.count(ts_uuid);
        if count == 0 {
            warn!(ts = %ts_uuid, "Move completed at tablet server without tracked moves");
            return;
        }
        self.set(ts_uuid, count, count - 1);
    }

    fn set(&mut self, ts_uuid: &str, from: usize, to: usize) {
        if let Some(servers) = self.servers_by_count.get_mut(&from) {
            servers.remove(ts_uuid);
            if servers.is_empty() {
                self.servers_by_count.remove(&from);
            }
        }
        self.servers_by_count
            .entry(to)
            .or_default()
            .insert(ts_uuid.to_string());
        self.count_per_server.insert(ts_uuid.to_string(), to);
    }

    /// Servers with fewer than `cap` moves, least loaded first
    pub fn servers_below(&self, cap: usize) -> impl Iterator<Item = &str> {
        self.servers_by_count
            .range(..cap)
            .flat_map(|(_, servers)| servers.iter().map(String::as_str))
    }

    /// Recompute the counters from the given in-flight moves
    pub fn rebuild(&mut self, scheduled_moves: &MovesInProgress) {
        self.clear();
        for mv in scheduled_moves.values() {
            self.increment(&mv.ts_uuid_from);
            self.increment(&mv.ts_uuid_to);
        }
    }

    pub fn clear(&mut self) {
        self.count_per_server.clear();
        self.servers_by_count.clear();
    }

    #[cfg(test)]
    pub fn max_count(&self) -> usize {
        self.servers_by_count.keys().next_back().copied().unwrap_or(0)
    }

    /// Both indices describe the same counts
    pub fn is_consistent(&self) -> bool {
        let indexed: usize = self.servers_by_count.values().map(BTreeSet::len).sum();
        indexed == self.count_per_server.len()
            && self
                .servers_by_count
                .iter()
                .all(|(count, servers)| servers.iter().all(|s| self.count(s) == *count))
    }
}

/// State shared by runner implementations
pub struct BaseRunner {
    transport: Arc<dyn MoveTransport>,
    /// A move counts once at its source and once at its destination server
    pub(crate) max_moves_per_server: usize,
    deadline: Option<Instant>,
    rpc_timeout: Duration,
    master_addresses: Vec<String>,
    pub(crate) scheduled_moves: MovesInProgress,
    moves_count: u32,
    pub(crate) op_counts: OpCounters,
}

impl BaseRunner {
    pub fn new(
        transport: Arc<dyn MoveTransport>,
        max_moves_per_server: usize,
        deadline: Option<Instant>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            max_moves_per_server,
            deadline,
            rpc_timeout,
            master_addresses: Vec::new(),
            scheduled_moves: MovesInProgress::new(),
            moves_count: 0,
            op_counts: OpCounters::default(),
        }
    }

    #[instrument(skip(self))]
    pub async fn init(&mut self, master_addresses: &[String]) -> Result<()> {
        timeout(self.rpc_timeout, self.transport.connect(master_addresses))
            .await
            .unwrap_or(Err(TransportError::Timeout))?;
        self.master_addresses = master_addresses.to_vec();
        info!(masters = ?self.master_addresses, "Connected to cluster");
        Ok(())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Bound for a single transport call: the RPC timeout, cut short by the deadline
    fn call_timeout(&self) -> Duration {
        match self.deadline {
            Some(d) => self
                .rpc_timeout
                .min(d.saturating_duration_since(Instant::now())),
            None => self.rpc_timeout,
        }
    }

    pub async fn issue_move(&self, mv: &ReplicaMove) -> std::result::Result<(), TransportError> {
        timeout(self.call_timeout(), self.transport.issue_move(mv))
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    pub fn scheduled_moves(&self) -> &MovesInProgress {
        &self.scheduled_moves
    }

    pub fn moves_count(&self) -> u32 {
        self.moves_count
    }

    /// Update the counters once a move at the server is done
    pub fn update_on_move_completed(&mut self, ts_uuid: &str) {
        self.op_counts.decrement(ts_uuid);
    }

    fn forget_move(&mut self, mv: &ReplicaMove) {
        self.scheduled_moves.remove(&mv.tablet_id);
        self.update_on_move_completed(&mv.ts_uuid_from);
        self.update_on_move_completed(&mv.ts_uuid_to);
    }

    /// Poll all in-flight moves at once and apply the results.
    ///
    /// With `respect_deadline`, nothing is polled after the deadline and every
    /// call is cut short at the deadline.
    pub async fn poll_moves(&mut self, respect_deadline: bool) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        if respect_deadline && self.is_past_deadline() {
            outcome.timed_out = true;
            outcome.has_pending_moves = !self.scheduled_moves.is_empty();
            return outcome;
        }

        let call_timeout = if respect_deadline {
            self.call_timeout()
        } else {
            self.rpc_timeout
        };
        let mut moves: Vec<ReplicaMove> = self.scheduled_moves.values().cloned().collect();
        moves.sort_by(|a, b| a.tablet_id.cmp(&b.tablet_id));

        let transport = self.transport.as_ref();
        let results = join_all(moves.iter().map(|mv| async move {
            timeout(call_timeout, transport.poll_move(mv))
                .await
                .unwrap_or(Err(TransportError::Timeout))
        }))
        .await;

        for (mv, result) in moves.into_iter().zip(results) {
            match result {
                Ok(MoveStatus::InProgress) => {}
                Ok(MoveStatus::Completed) => {
                    self.moves_count += 1;
                    outcome.has_updates = true;
                    self.forget_move(&mv);
                    info!(tablet = %mv.tablet_id, src = %mv.ts_uuid_from, dst = %mv.ts_uuid_to, "Move completed");
                }
                Ok(MoveStatus::Failed(reason)) => {
                    outcome.has_updates = true;
                    self.forget_move(&mv);
                    warn!(tablet = %mv.tablet_id, src = %mv.ts_uuid_from, dst = %mv.ts_uuid_to, reason = %reason, "Move failed");
                }
                Err(TransportError::Timeout) if respect_deadline && self.is_past_deadline() => {
                    // Still in flight as far as we know; reaped after the run.
                    outcome.timed_out = true;
                }
                Err(e @ TransportError::Unreachable(_)) => {
                    outcome.has_errors = true;
                    warn!(tablet = %mv.tablet_id, error = %e, "Cluster unreachable while polling move");
                    if outcome.connectivity_error.is_none() {
                        outcome.connectivity_error = Some(e);
                    }
                }
                Err(e) => {
                    outcome.has_errors = true;
                    outcome.must_reset = true;
                    self.forget_move(&mv);
                    warn!(tablet = %mv.tablet_id, src = %mv.ts_uuid_from, dst = %mv.ts_uuid_to, error = %e, "Move abandoned");
                }
            }
        }

        if respect_deadline && self.is_past_deadline() {
            outcome.timed_out = true;
        }
        outcome.has_pending_moves = !self.scheduled_moves.is_empty();
        outcome
    }

    /// Drop all in-flight moves and their counters
    pub fn reset(&mut self) {
        if !self.scheduled_moves.is_empty() {
            info!(moves = self.scheduled_moves.len(), "Discarding state of in-flight moves");
        }
        self.scheduled_moves.clear();
        self.op_counts.clear();
    }
}
