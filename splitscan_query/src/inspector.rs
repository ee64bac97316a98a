//! Decides whether a query's plan can be split into independent per-partition reads.

use observability_deps::tracing::debug;
use splitscan_client::{DatabaseClient, ErrorCode, PlanNode, PlanNodeKind, Query};

use crate::{Error, Result};

/// Whether a query is root-partitionable and, if not, why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPartitionableDecision {
    pub is_partitionable: bool,
    /// Explanation shown to the user when the query is not partitionable
    pub reason: Option<String>,
    /// Table read by the plan's first scan, if any
    pub table: Option<String>,
}

impl RootPartitionableDecision {
    fn partitionable(table: Option<String>) -> Self {
        Self {
            is_partitionable: true,
            reason: None,
            table,
        }
    }

    fn not_partitionable(reason: String, table: Option<String>) -> Self {
        Self {
            is_partitionable: false,
            reason: Some(reason),
            table,
        }
    }
}

/// Fetch the plan for `query` and decide whether it is root-partitionable
///
/// Issues exactly one plan request. Only the root operator is inspected: the database places a
/// distributed union at the root of every plan that can be read partition by partition.
pub async fn inspect(
    client: &dyn DatabaseClient,
    query: &Query,
) -> Result<RootPartitionableDecision> {
    validate(query)?;

    let plan = client
        .get_query_plan(query)
        .await
        .map_err(|e| match e.code() {
            ErrorCode::Unavailable => Error::BackendUnavailable(e),
            ErrorCode::InvalidArgument => Error::InvalidQuery(e.message().to_string()),
            _ => Error::PlanInspectionFailed {
                reason: "query plan request failed".to_string(),
                source: Some(e),
            },
        })?;

    let root = plan.root().ok_or_else(|| Error::PlanInspectionFailed {
        reason: "database returned an empty plan".to_string(),
        source: None,
    })?;

    let decision = decide(root);
    debug!(
        sql = query.sql(),
        root = %root.kind(),
        is_partitionable = decision.is_partitionable,
        "inspected query plan"
    );
    Ok(decision)
}

/// Reject empty queries and parameters the SQL never references
fn validate(query: &Query) -> Result<()> {
    if query.sql().trim().is_empty() {
        return Err(Error::InvalidQuery("query is empty".to_string()));
    }

    let unreferenced: Vec<&str> = query
        .params()
        .names()
        .filter(|name| !query.references_param(name))
        .collect();
    if !unreferenced.is_empty() {
        return Err(Error::InvalidQuery(format!(
            "parameters not referenced in query: {}",
            unreferenced.join(", ")
        )));
    }

    Ok(())
}

fn decide(root: &PlanNode) -> RootPartitionableDecision {
    let table = root.scanned_table().map(ToString::to_string);
    // every kind is listed so that new operators have to be classified explicitly
    let reason = match root.kind() {
        PlanNodeKind::DistributedUnion => {
            return RootPartitionableDecision::partitionable(table);
        }
        PlanNodeKind::Aggregate => {
            "the root operator aggregates rows from every partition".to_string()
        }
        PlanNodeKind::Sort | PlanNodeKind::DistributedMergeUnion => {
            "the root operator merges sorted rows from every partition".to_string()
        }
        PlanNodeKind::Limit => "the root operator limits rows across every partition".to_string(),
        PlanNodeKind::Join => {
            let interleaving = if root.metadata().interleaved {
                "interleaved"
            } else {
                "non-interleaved"
            };
            format!("the root operator is a {interleaving} join that must run across partitions")
        }
        PlanNodeKind::LocalDistributedUnion
        | PlanNodeKind::DistributedCrossApply
        | PlanNodeKind::Scan
        | PlanNodeKind::Filter
        | PlanNodeKind::FilterScan
        | PlanNodeKind::Union
        | PlanNodeKind::SerializeResult
        | PlanNodeKind::Compute => format!(
            "the root operator is {}, not {}",
            root.kind(),
            PlanNodeKind::DistributedUnion
        ),
        PlanNodeKind::Unknown(name) => format!("the root operator '{name}' is not recognized"),
    };
    RootPartitionableDecision::not_partitionable(reason, table)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use splitscan_client::{ClientError, ExecutionPlan, JoinType};
    use splitscan_test_helpers::MockDatabase;

    use super::*;

    fn distributed_scan(table: &str) -> PlanNode {
        PlanNode::new(PlanNodeKind::DistributedUnion).with_child(
            PlanNode::new(PlanNodeKind::SerializeResult).with_child(PlanNode::scan(table)),
        )
    }

    #[test]
    fn only_distributed_union_roots_are_partitionable() {
        let decision = decide(&distributed_scan("t"));
        assert_eq!(
            decision,
            RootPartitionableDecision {
                is_partitionable: true,
                reason: None,
                table: Some("t".to_string()),
            }
        );

        let roots = [
            PlanNode::new(PlanNodeKind::Aggregate).with_child(distributed_scan("t")),
            PlanNode::new(PlanNodeKind::Sort).with_child(distributed_scan("t")),
            PlanNode::new(PlanNodeKind::DistributedMergeUnion).with_child(PlanNode::scan("t")),
            PlanNode::new(PlanNodeKind::Limit).with_child(distributed_scan("t")),
            PlanNode::new(PlanNodeKind::Join)
                .with_join(JoinType::Inner, false)
                .with_child(distributed_scan("a"))
                .with_child(distributed_scan("b")),
            PlanNode::new(PlanNodeKind::LocalDistributedUnion).with_child(PlanNode::scan("t")),
            PlanNode::scan("t"),
            PlanNode::new(PlanNodeKind::Unknown("Batch Scan".to_string())),
        ];
        for root in roots {
            let decision = decide(&root);
            assert!(!decision.is_partitionable, "{} was partitionable", root.kind());
            assert!(decision.reason.is_some());
        }
    }

    #[test]
    fn unknown_root_reason_names_the_operator() {
        let decision = decide(&PlanNode::new(PlanNodeKind::Unknown("Batch Scan".into())));
        assert_eq!(
            decision.reason.as_deref(),
            Some("the root operator 'Batch Scan' is not recognized")
        );
    }

    #[test_log::test(tokio::test)]
    async fn inspect_fetches_one_plan() {
        let sql = "SELECT a+b FROM t";
        let db = Arc::new(MockDatabase::new().with_plan(sql, distributed_scan("t")));
        let decision = inspect(db.as_ref(), &Query::new(sql)).await.unwrap();
        assert!(decision.is_partitionable);
        assert_eq!(db.plan_requests(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn aggregate_root_is_not_partitionable() {
        let sql = "SELECT sum(a) FROM t";
        let db = MockDatabase::new().with_plan(
            sql,
            PlanNode::new(PlanNodeKind::Aggregate).with_child(distributed_scan("t")),
        );
        let decision = inspect(&db, &Query::new(sql)).await.unwrap();
        assert!(!decision.is_partitionable);
        assert_eq!(decision.table.as_deref(), Some("t"));
    }

    #[test_log::test(tokio::test)]
    async fn invalid_queries_are_rejected_before_planning() {
        let db = MockDatabase::new().with_plan("SELECT 1", distributed_scan("t"));

        let err = inspect(&db, &Query::new("   ")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)), "got {err}");

        let query = Query::new("SELECT * FROM t WHERE a = @a")
            .with_param("a", 1)
            .with_param("b", 2);
        let err = inspect(&db, &query).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid query: parameters not referenced in query: b"
        );

        assert_eq!(db.plan_requests(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn referenced_params_are_accepted() {
        let sql = "SELECT * FROM t WHERE a = @a";
        let db = MockDatabase::new().with_plan(sql, distributed_scan("t"));
        let query = Query::new(sql).with_param("a", 1);
        assert!(inspect(&db, &query).await.unwrap().is_partitionable);
    }

    #[test_log::test(tokio::test)]
    async fn param_names_match_regardless_of_case() {
        let sql = "SELECT * FROM t WHERE region = @Region";
        let db = MockDatabase::new().with_plan(sql, distributed_scan("t"));
        let query = Query::new(sql).with_param("region", "eu");
        assert!(inspect(&db, &query).await.unwrap().is_partitionable);
        assert_eq!(db.plan_requests(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn plan_errors() {
        let db = MockDatabase::new().with_plan_result("empty", Ok(ExecutionPlan::empty()));
        let err = inspect(&db, &Query::new("empty")).await.unwrap_err();
        assert!(
            matches!(err, Error::PlanInspectionFailed { source: None, .. }),
            "got {err}"
        );

        let db = MockDatabase::new()
            .with_plan_result("down", Err(ClientError::unavailable("connection refused")));
        let err = inspect(&db, &Query::new("down")).await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)), "got {err}");

        let db = MockDatabase::new();
        let err = inspect(&db, &Query::new("SELEC oops")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)), "got {err}");

        let db = MockDatabase::new()
            .with_plan_result("boom", Err(ClientError::internal("planner crashed")));
        let err = inspect(&db, &Query::new("boom")).await.unwrap_err();
        assert!(
            matches!(err, Error::PlanInspectionFailed { source: Some(_), .. }),
            "got {err}"
        );
    }
}
