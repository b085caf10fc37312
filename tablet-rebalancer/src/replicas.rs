//! Translation of table-level moves into concrete tablet replicas

use tablet_core::{CheckResult, MovesInProgress, ReplicaMove, TableReplicaMove, TabletSummary};
use tracing::debug;

use crate::inspector::ClusterRawInfo;

/// Find tablets of the move's table that could be moved from `move.from` to
/// `move.to`.
///
/// A tablet qualifies if it is healthy, has a replica on the source server
/// which is healthy, and has no replica on the destination server. The
/// result is sorted by tablet id and may be empty.
pub fn find_replicas<'a>(
    mv: &TableReplicaMove,
    raw_info: &'a ClusterRawInfo,
    move_rf1_replicas: bool,
) -> Vec<&'a TabletSummary> {
    if !move_rf1_replicas {
        let is_rf1 = raw_info
            .table_summaries
            .iter()
            .any(|t| t.id == mv.table_id && t.replication_factor == 1);
        if is_rf1 {
            debug!(table = %mv.table_id, "Not moving replicas of a table with replication factor 1");
            return Vec::new();
        }
    }

    let mut tablets: Vec<&TabletSummary> = raw_info
        .tablet_summaries
        .iter()
        .filter(|t| t.table_id == mv.table_id)
        .filter(|t| {
            if t.result != CheckResult::Healthy {
                debug!(
                    table = %mv.table_id,
                    tablet = %t.id,
                    status = %t.result,
                    "Not considering replicas of the tablet as candidates for movement"
                );
                return false;
            }
            let src_ok = t
                .replicas
                .iter()
                .any(|r| r.ts_uuid == mv.from && r.ts_healthy);
            src_ok && !t.has_replica_on(&mv.to)
        })
        .collect();

    tablets.sort_by(|a, b| a.id.cmp(&b.id));
    tablets
}

/// Remove moves for tablets which already have a move in progress
pub fn filter_moves(scheduled_moves: &MovesInProgress, replica_moves: &mut Vec<ReplicaMove>) {
    replica_moves.retain(|mv| {
        let keep = !scheduled_moves.contains_key(&mv.tablet_id);
        if !keep {
            debug!(tablet = %mv.tablet_id, "Dropping move: tablet already has a move in progress");
        }
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_core::{ReplicaSummary, TableSummary};

    fn replica(ts: &str, healthy: bool) -> ReplicaSummary {
        ReplicaSummary {
            ts_uuid: ts.to_string(),
            ts_address: None,
            ts_healthy: healthy,
            is_leader: false,
            is_voter: true,
        }
    }

    fn tablet(id: &str, table_id: &str, result: CheckResult, replicas: Vec<ReplicaSummary>) -> TabletSummary {
        TabletSummary {
            id: id.to_string(),
            table_id: table_id.to_string(),
            table_name: table_id.to_string(),
            result,
            replicas,
            config_opid_idx: Some(10),
        }
    }

    fn raw_info(rf: u32) -> ClusterRawInfo {
        ClusterRawInfo {
            server_summaries: Vec::new(),
            table_summaries: vec![TableSummary {
                id: "tbl".to_string(),
                name: "tbl".to_string(),
                replication_factor: rf,
                result: CheckResult::Healthy,
            }],
            tablet_summaries: vec![
                tablet("t3", "tbl", CheckResult::Healthy, vec![replica("ts-1", true)]),
                tablet("t1", "tbl", CheckResult::Healthy, vec![replica("ts-1", true)]),
                // already has a replica at the destination
                tablet("t2", "tbl", CheckResult::Healthy, vec![replica("ts-1", true), replica("ts-2", true)]),
                tablet("t4", "tbl", CheckResult::UnderReplicated, vec![replica("ts-1", true)]),
                tablet("t5", "tbl", CheckResult::Healthy, vec![replica("ts-1", false)]),
                tablet("t6", "other", CheckResult::Healthy, vec![replica("ts-1", true)]),
                tablet("t7", "tbl", CheckResult::Healthy, vec![replica("ts-3", true)]),
            ],
        }
    }

    fn table_move() -> TableReplicaMove {
        TableReplicaMove {
            table_id: "tbl".to_string(),
            from: "ts-1".to_string(),
            to: "ts-2".to_string(),
        }
    }

    #[test]
    fn test_find_replicas_picks_eligible_tablets() {
        let raw = raw_info(3);
        let ids: Vec<_> = find_replicas(&table_move(), &raw, false)
            .into_iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ids, vec!["t1", "t3"]);
    }

    #[test]
    fn test_find_replicas_skips_rf1_tables() {
        let raw = raw_info(1);
        assert!(find_replicas(&table_move(), &raw, false).is_empty());
        assert_eq!(find_replicas(&table_move(), &raw, true).len(), 2);
    }

    #[test]
    fn test_find_replicas_nothing_found() {
        let raw = raw_info(3);
        let mv = TableReplicaMove {
            table_id: "tbl".to_string(),
            from: "ts-9".to_string(),
            to: "ts-2".to_string(),
        };
        assert!(find_replicas(&mv, &raw, false).is_empty());
    }

    #[test]
    fn test_filter_moves() {
        let mut scheduled = MovesInProgress::new();
        scheduled.insert("t1".to_string(), ReplicaMove::new("t1", "ts-1", "ts-2"));

        let mut moves = vec![
            ReplicaMove::new("t1", "ts-3", "ts-4"),
            ReplicaMove::new("t2", "ts-1", "ts-2"),
        ];
        filter_moves(&scheduled, &mut moves);
        assert_eq!(moves, vec![ReplicaMove::new("t2", "ts-1", "ts-2")]);
    }
}
