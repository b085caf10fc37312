//! Tablet Rebalancer
//!
//! Rebalances the replicas of a simulated cluster loaded from a JSON
//! snapshot. Settings come from `REBALANCER_*` environment variables and can
//! be overridden on the command line.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tablet_rebalancer::{
    build_cluster_info, ClusterSnapshot, InMemoryCluster, Rebalancer, RebalancerConfig,
    RunStatus,
};

#[derive(Parser)]
#[command(name = "tablet-rebalancer")]
#[command(about = "Rebalance tablet replicas across tablet servers")]
struct Cli {
    /// Cluster snapshot to rebalance (JSON)
    #[arg(long)]
    cluster_snapshot: PathBuf,

    /// Master addresses, comma-separated
    #[arg(long, value_delimiter = ',')]
    masters: Option<Vec<String>>,

    /// Tables to balance, comma-separated names or glob patterns
    #[arg(long, value_delimiter = ',')]
    tables: Option<Vec<String>>,

    /// Maximum number of concurrent moves per tablet server
    #[arg(long)]
    max_moves_per_server: Option<usize>,

    /// Maximum time without progress, in seconds
    #[arg(long)]
    max_staleness_interval_sec: Option<u64>,

    /// Maximum run time in seconds, 0 for no limit
    #[arg(long)]
    max_run_time_sec: Option<u64>,

    /// Move replicas of tablets with replication factor 1
    #[arg(long)]
    move_rf1_replicas: bool,

    /// Log the per-table replica distribution on every cycle
    #[arg(long)]
    output_replica_distribution_details: bool,

    /// Only balance tablet servers in this location
    #[arg(long)]
    location: Option<String>,

    /// Number of status polls a simulated move takes
    #[arg(long, default_value = "3")]
    move_latency_polls: u32,

    /// Print the moves the algorithm would make and exit
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

impl Cli {
    fn apply(&self, config: &mut RebalancerConfig) {
        if let Some(masters) = &self.masters {
            config.master_addresses = masters.clone();
        }
        if let Some(tables) = &self.tables {
            config.table_filters = tables.clone();
        }
        if let Some(max_moves) = self.max_moves_per_server {
            config.max_moves_per_server = max_moves;
        }
        if let Some(staleness) = self.max_staleness_interval_sec {
            config.max_staleness_interval_secs = staleness;
        }
        if let Some(run_time) = self.max_run_time_sec {
            config.max_run_time_secs = run_time;
        }
        if self.move_rf1_replicas {
            config.move_rf1_replicas = true;
        }
        if self.output_replica_distribution_details {
            config.output_replica_distribution_details = true;
        }
        if let Some(location) = &self.location {
            config.location = Some(location.clone());
        }
    }
}

fn log_distribution(label: &str, snapshot: &ClusterSnapshot) {
    for (uuid, count) in snapshot.replicas_per_server() {
        info!(ts = %uuid, replicas = count, "{}", label);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let mut config = RebalancerConfig::from_env().context("Failed to load configuration")?;
    cli.apply(&mut config);

    let snapshot = ClusterSnapshot::load_json(&cli.cluster_snapshot).with_context(|| {
        format!("Failed to load snapshot {}", cli.cluster_snapshot.display())
    })?;
    info!(
        snapshot = %cli.cluster_snapshot.display(),
        servers = snapshot.servers.len(),
        tables = snapshot.tables.len(),
        tablets = snapshot.tablets.len(),
        max_moves_per_server = config.max_moves_per_server,
        dry_run = cli.dry_run,
        "Starting tablet rebalancer"
    );
    log_distribution("Replicas before rebalancing", &snapshot);

    let cluster = Arc::new(InMemoryCluster::new(snapshot).with_move_latency(cli.move_latency_polls));
    let rebalancer = Rebalancer::new(config, cluster.clone(), cluster.clone())?;

    if cli.dry_run {
        let raw_info = rebalancer.get_cluster_raw_info().await?;
        let cluster_info = build_cluster_info(
            &raw_info,
            &Default::default(),
            rebalancer.config().move_rf1_replicas,
        )?;
        info!(summary = %cluster_info.balance.summary(), "Current balance");

        let max_moves = rebalancer.config().max_moves_per_server
            * cluster_info.balance.replicas_by_server.len()
            * 5;
        let moves = rebalancer.get_next_moves(&cluster_info, max_moves)?;
        for mv in &moves {
            info!(table = %mv.table_id, src = %mv.from, dst = %mv.to, "Would move replica");
        }
        info!(moves = moves.len(), "Dry run complete");
        return Ok(());
    }

    let (status, moves_count) = rebalancer.run().await?;
    match status {
        RunStatus::ClusterIsBalanced => {
            info!(moves = moves_count, "Cluster is balanced");
        }
        RunStatus::TimedOut => {
            warn!(moves = moves_count, in_flight = cluster.in_flight(), "Rebalancing timed out");
        }
        RunStatus::Unknown => {
            warn!(moves = moves_count, "Rebalancing ended in unknown state");
        }
    }
    log_distribution("Replicas after rebalancing", &cluster.snapshot());

    Ok(())
}
