//! Cluster inspection
//!
//! The rebalancer learns about the cluster only through [`ClusterInspector`],
//! and keeps only the part of its output relevant to rebalancing
//! ([`ClusterRawInfo`]).

use std::collections::HashSet;
use tablet_core::{
    InspectionResults, ServerHealthSummary, TableFilter, TableSummary, TabletSummary,
};
use thiserror::Error;
use tracing::{debug, instrument};

/// Inspection errors
#[derive(Error, Debug, Clone)]
pub enum InspectError {
    #[error("Masters unreachable: {0}")]
    Unreachable(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Inspection error: {0}")]
    Internal(String),
}

/// Source of cluster health and placement snapshots
#[async_trait::async_trait]
pub trait ClusterInspector: Send + Sync {
    /// Inspect the cluster, reporting only tables matching `filter`
    async fn inspect(&self, filter: &TableFilter) -> Result<InspectionResults, InspectError>;
}

/// Sub-set of inspection results relevant to rebalancing
#[derive(Debug, Clone, Default)]
pub struct ClusterRawInfo {
    pub server_summaries: Vec<ServerHealthSummary>,
    pub table_summaries: Vec<TableSummary>,
    pub tablet_summaries: Vec<TabletSummary>,
}

impl ClusterRawInfo {
    /// Convert inspection results, optionally restricted to one location.
    ///
    /// With a location, servers outside it are dropped, tablets are kept if
    /// at least one replica is hosted in the location, and tables are kept if
    /// they still have tablets.
    pub fn from_inspection(results: InspectionResults, location: Option<&str>) -> Self {
        let Some(location) = location else {
            return Self {
                server_summaries: results.server_summaries,
                table_summaries: results.table_summaries,
                tablet_summaries: results.tablet_summaries,
            };
        };

        let server_summaries: Vec<_> = results
            .server_summaries
            .into_iter()
            .filter(|s| s.location.as_deref() == Some(location))
            .collect();
        let server_ids: HashSet<&str> = server_summaries.iter().map(|s| s.uuid.as_str()).collect();

        let tablet_summaries: Vec<_> = results
            .tablet_summaries
            .into_iter()
            .filter(|t| t.replicas.iter().any(|r| server_ids.contains(r.ts_uuid.as_str())))
            .collect();
        let table_ids: HashSet<&str> = tablet_summaries.iter().map(|t| t.table_id.as_str()).collect();

        let table_summaries = results
            .table_summaries
            .into_iter()
            .filter(|t| table_ids.contains(t.id.as_str()))
            .collect();

        Self {
            server_summaries,
            table_summaries,
            tablet_summaries,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} tablet servers, {} tables, {} tablets",
            self.server_summaries.len(),
            self.table_summaries.len(),
            self.tablet_summaries.len()
        )
    }
}

/// Run the inspector and convert its output
#[instrument(skip(inspector, filter))]
pub async fn fetch_cluster_raw_info(
    inspector: &dyn ClusterInspector,
    filter: &TableFilter,
    location: Option<&str>,
) -> Result<ClusterRawInfo, InspectError> {
    let results = inspector.inspect(filter).await?;
    let raw_info = ClusterRawInfo::from_inspection(results, location);
    debug!(summary = %raw_info.summary(), "Cluster inspected");
    Ok(raw_info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_core::{CheckResult, ReplicaSummary, ServerHealth};

    fn server(uuid: &str, location: &str) -> ServerHealthSummary {
        ServerHealthSummary {
            uuid: uuid.to_string(),
            address: format!("{}:7050", uuid),
            health: ServerHealth::Healthy,
            location: Some(location.to_string()),
        }
    }

    fn tablet(id: &str, table_id: &str, replicas: &[&str]) -> TabletSummary {
        TabletSummary {
            id: id.to_string(),
            table_id: table_id.to_string(),
            table_name: table_id.to_string(),
            result: CheckResult::Healthy,
            replicas: replicas
                .iter()
                .map(|ts| ReplicaSummary {
                    ts_uuid: ts.to_string(),
                    ts_address: None,
                    ts_healthy: true,
                    is_leader: false,
                    is_voter: true,
                })
                .collect(),
            config_opid_idx: Some(1),
        }
    }

    fn table(id: &str) -> TableSummary {
        TableSummary {
            id: id.to_string(),
            name: id.to_string(),
            replication_factor: 1,
            result: CheckResult::Healthy,
        }
    }

    fn results() -> InspectionResults {
        InspectionResults {
            server_summaries: vec![server("a1", "/dc-a"), server("a2", "/dc-a"), server("b1", "/dc-b")],
            table_summaries: vec![table("t-a"), table("t-b")],
            tablet_summaries: vec![tablet("x", "t-a", &["a1"]), tablet("y", "t-b", &["b1"])],
        }
    }

    #[test]
    fn test_from_inspection_without_location_keeps_everything() {
        let raw = ClusterRawInfo::from_inspection(results(), None);
        assert_eq!(raw.server_summaries.len(), 3);
        assert_eq!(raw.table_summaries.len(), 2);
        assert_eq!(raw.tablet_summaries.len(), 2);
        assert_eq!(raw.summary(), "3 tablet servers, 2 tables, 2 tablets");
    }

    #[test]
    fn test_from_inspection_filters_by_location() {
        let raw = ClusterRawInfo::from_inspection(results(), Some("/dc-a"));
        let servers: Vec<_> = raw.server_summaries.iter().map(|s| s.uuid.as_str()).collect();
        assert_eq!(servers, vec!["a1", "a2"]);
        assert_eq!(raw.tablet_summaries.len(), 1);
        assert_eq!(raw.tablet_summaries[0].id, "x");
        assert_eq!(raw.table_summaries.len(), 1);
        assert_eq!(raw.table_summaries[0].id, "t-a");
    }

    struct FailingInspector;

    #[async_trait::async_trait]
    impl ClusterInspector for FailingInspector {
        async fn inspect(&self, _filter: &TableFilter) -> Result<InspectionResults, InspectError> {
            Err(InspectError::Unreachable("m1:7051".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fetch_surfaces_inspector_error() {
        let err = fetch_cluster_raw_info(&FailingInspector, &TableFilter::all(), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Masters unreachable: m1:7051");
    }
}
