//! Concatenates per-partition rows into a single result set.

use std::sync::Arc;

use splitscan_client::{PartitionRows, Schema};

use crate::{Error, FailurePolicy, Result, executor::PartitionResult, result_set::ResultSet};

/// Concatenate the rows of every partition in `results`, in the order given
///
/// Every partition that returned rows must report the same schema. A partition that returned no
/// rows and no columns says nothing about the schema and is accepted alongside any other.
///
/// With [`FailurePolicy::Abort`] the first failed partition fails the whole result with
/// [`Error::PartialFailure`]. With [`FailurePolicy::BestEffort`] failed partitions are skipped
/// and counted in [`ResultSet::failed_partitions`].
pub fn assemble(results: &[PartitionResult], policy: FailurePolicy) -> Result<ResultSet> {
    if policy == FailurePolicy::Abort {
        let mut failures = results
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|e| (r, e)));
        if let Some((failed, source)) = failures.next() {
            return Err(Error::PartialFailure {
                partition: failed.index,
                token: Arc::clone(&failed.token),
                source: source.clone(),
                other_failures: failures.count(),
            });
        }
    }

    let mut schema: Option<&Schema> = None;
    let mut rows = Vec::with_capacity(
        results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok())
            .map(|p| p.rows.len())
            .sum(),
    );
    let mut failed_partitions = 0;

    for result in results {
        let partition = match &result.outcome {
            Ok(partition) => partition,
            Err(_) => {
                failed_partitions += 1;
                continue;
            }
        };
        if is_shapeless(partition) {
            continue;
        }

        match schema {
            None => schema = Some(&partition.schema),
            Some(expected) if *expected != partition.schema => {
                return Err(Error::SchemaMismatch {
                    partition: result.index,
                    reason: format!("expected {expected}, got {}", partition.schema),
                });
            }
            Some(_) => {}
        }

        let width = partition.schema.len();
        if let Some(row) = partition.rows.iter().position(|r| r.len() != width) {
            return Err(Error::SchemaMismatch {
                partition: result.index,
                reason: format!(
                    "row {row} has {} value(s) but the schema has {width} column(s)",
                    partition.rows[row].len()
                ),
            });
        }

        rows.extend(partition.rows.iter().cloned());
    }

    Ok(
        ResultSet::new(schema.cloned().unwrap_or_default(), rows)
            .with_failed_partitions(failed_partitions),
    )
}

fn is_shapeless(partition: &PartitionRows) -> bool {
    partition.schema.is_empty() && partition.rows.is_empty()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use splitscan_client::{ClientError, ColumnType, PartitionToken, SessionId, Value};
    use splitscan_test_helpers::{int_rows, int_schema};

    use super::*;
    use crate::executor::PartitionError;

    fn ok(index: usize, schema: Schema, rows: Vec<Vec<Value>>) -> PartitionResult {
        PartitionResult {
            index,
            token: Arc::new(PartitionToken::new(SessionId::new(), vec![index as u8])),
            outcome: Ok(PartitionRows::new(schema, rows)),
        }
    }

    fn failed(index: usize) -> PartitionResult {
        PartitionResult {
            index,
            token: Arc::new(PartitionToken::new(SessionId::new(), vec![index as u8])),
            outcome: Err(PartitionError::ReadFailed {
                attempts: 1,
                source: ClientError::internal("disk on fire"),
            }),
        }
    }

    #[test]
    fn concatenates_in_partition_order() {
        let results = vec![
            ok(0, int_schema("col"), int_rows(0..10)),
            ok(1, int_schema("col"), int_rows(10..15)),
            ok(2, int_schema("col"), int_rows(15..22)),
        ];

        let result_set = assemble(&results, FailurePolicy::Abort).unwrap();

        assert_eq!(result_set.schema(), &int_schema("col"));
        assert_eq!(result_set.rows(), int_rows(0..22).as_slice());
        assert_eq!(result_set.failed_partitions(), 0);

        // same input, same output
        assert_eq!(assemble(&results, FailurePolicy::Abort).unwrap(), result_set);
    }

    #[test]
    fn no_partitions_is_an_empty_result() {
        let result_set = assemble(&[], FailurePolicy::Abort).unwrap();
        assert_eq!(result_set.num_rows(), 0);
        assert!(result_set.schema().is_empty());
    }

    #[test]
    fn empty_partitions_keep_the_schema() {
        let results = vec![
            ok(0, int_schema("col"), vec![]),
            ok(1, Schema::empty(), vec![]),
            ok(2, int_schema("col"), int_rows(0..3)),
        ];
        let result_set = assemble(&results, FailurePolicy::Abort).unwrap();
        assert_eq!(result_set.schema(), &int_schema("col"));
        assert_eq!(result_set.num_rows(), 3);
    }

    #[test]
    fn mismatched_schemas_are_rejected() {
        let other = Schema::from_iter([("col".to_string(), ColumnType::String)]);
        let results = vec![
            ok(0, int_schema("col"), int_rows(0..2)),
            ok(1, other, vec![vec![Value::from("x")]]),
        ];

        let err = assemble(&results, FailurePolicy::Abort).unwrap_err();

        assert_eq!(
            err.to_string(),
            "partition 1 does not match the result schema: \
             expected [(col, INT64)], got [(col, STRING)]"
        );
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let results = vec![ok(
            0,
            int_schema("col"),
            vec![vec![Value::Int64(1)], vec![Value::Int64(2), Value::Int64(3)]],
        )];
        let err = assemble(&results, FailurePolicy::Abort).unwrap_err();
        assert!(
            matches!(err, Error::SchemaMismatch { partition: 0, .. }),
            "got {err}"
        );
    }

    #[test]
    fn abort_reports_the_first_failure() {
        let results = vec![
            ok(0, int_schema("col"), int_rows(0..2)),
            failed(1),
            ok(2, int_schema("col"), int_rows(2..4)),
            failed(3),
        ];

        let err = assemble(&results, FailurePolicy::Abort).unwrap_err();

        match err {
            Error::PartialFailure {
                partition,
                token,
                other_failures,
                ..
            } => {
                assert_eq!(partition, 1);
                assert_eq!(token, results[1].token);
                assert_eq!(other_failures, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn best_effort_skips_failures() {
        let results = vec![
            ok(0, int_schema("col"), int_rows(0..2)),
            failed(1),
            ok(2, int_schema("col"), int_rows(2..4)),
        ];

        let result_set = assemble(&results, FailurePolicy::BestEffort).unwrap();

        assert_eq!(result_set.rows(), int_rows(0..4).as_slice());
        assert_eq!(result_set.failed_partitions(), 1);
    }
}
