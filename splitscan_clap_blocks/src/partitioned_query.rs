//! Config for running partitioned queries.

use std::{num::NonZeroUsize, time::Duration};

use splitscan_client::{Query, QueryParams};
use splitscan_query::{BackoffConfig, FailurePolicy, QueryOptions};

/// What a query does when some partitions still fail after retrying.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum PartialFailurePolicy {
    /// Fail the query.
    #[default]
    Abort,

    /// Return the rows of the partitions that succeeded.
    BestEffort,
}

impl From<PartialFailurePolicy> for FailurePolicy {
    fn from(policy: PartialFailurePolicy) -> Self {
        match policy {
            PartialFailurePolicy::Abort => Self::Abort,
            PartialFailurePolicy::BestEffort => Self::BestEffort,
        }
    }
}

/// CLI config for partitioned queries
#[derive(Debug, Clone, clap::Parser)]
pub struct PartitionedQueryConfig {
    /// Maximum number of partitions read at the same time.
    ///
    /// Defaults to the number of CPUs available.
    #[clap(long = "concurrency-limit", env = "SPLITSCAN_CONCURRENCY_LIMIT", action)]
    pub concurrency_limit: Option<NonZeroUsize>,

    /// Suggested upper bound on the number of partitions a query is split into.
    ///
    /// The database treats this as a hint and may return more or fewer partitions.
    #[clap(long = "max-partitions", env = "SPLITSCAN_MAX_PARTITIONS", action)]
    pub max_partitions: Option<NonZeroUsize>,

    /// Number of times a partition read that fails with a transient error is retried.
    #[clap(
        long = "retry-budget",
        env = "SPLITSCAN_RETRY_BUDGET",
        default_value = "5",
        action
    )]
    pub retry_budget: usize,

    /// Delay before the first retry of a partition read.
    #[clap(
        long = "retry-initial-backoff",
        env = "SPLITSCAN_RETRY_INITIAL_BACKOFF",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    pub retry_initial_backoff: Duration,

    /// Upper bound on the delay between retries of a partition read.
    #[clap(
        long = "retry-max-backoff",
        env = "SPLITSCAN_RETRY_MAX_BACKOFF",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub retry_max_backoff: Duration,

    /// Time limit for a whole query, from planning until every partition has been read.
    ///
    /// Queries are not time limited by default.
    #[clap(
        long = "query-timeout",
        env = "SPLITSCAN_QUERY_TIMEOUT",
        value_parser = humantime::parse_duration
    )]
    pub query_timeout: Option<Duration>,

    /// How long in-flight partition reads get to stop after a query is cancelled or times out.
    #[clap(
        long = "shutdown-timeout",
        env = "SPLITSCAN_SHUTDOWN_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub shutdown_timeout: Duration,

    /// What to do when some partitions fail after retrying.
    #[clap(
        long = "on-partial-failure",
        env = "SPLITSCAN_ON_PARTIAL_FAILURE",
        default_value = "abort",
        value_enum,
        action
    )]
    pub on_partial_failure: PartialFailurePolicy,

    /// Query parameters as a JSON object, referenced in SQL as `@name`.
    ///
    /// # Example
    /// ```text
    /// --params '{"region": "eu", "min_id": 100}'
    /// ```
    #[clap(
        long = "params",
        env = "SPLITSCAN_PARAMS",
        value_parser = parse_params,
        action
    )]
    pub params: Option<QueryParams>,
}

impl PartitionedQueryConfig {
    /// The [`QueryOptions`] described by this config
    pub fn options(&self) -> QueryOptions {
        let defaults = QueryOptions::default();
        QueryOptions {
            concurrency_limit: self.concurrency_limit.unwrap_or(defaults.concurrency_limit),
            max_partitions_hint: self.max_partitions,
            retry_budget: self.retry_budget,
            overall_timeout: self.query_timeout,
            on_partial_failure: self.on_partial_failure.into(),
            backoff: BackoffConfig {
                init_backoff: self.retry_initial_backoff,
                max_backoff: self.retry_max_backoff,
                ..defaults.backoff
            },
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    /// Bind the configured parameters to `sql`
    pub fn query(&self, sql: impl Into<String>) -> Query {
        Query::new(sql).with_params(self.params.clone().unwrap_or_default())
    }
}

fn parse_params(
    s: &str,
) -> Result<QueryParams, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let json: serde_json::Value = serde_json::from_str(s)?;
    Ok(QueryParams::from_json(json)?)
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use splitscan_client::Value;

    use super::*;

    #[test]
    fn defaults() {
        let config = PartitionedQueryConfig::parse_from([""]);
        let options = config.options();

        assert_eq!(options.retry_budget, 5);
        assert_eq!(options.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(options.overall_timeout, None);
        assert_eq!(options.max_partitions_hint, None);
        assert_eq!(options.on_partial_failure, FailurePolicy::Abort);
        assert_eq!(options.backoff, QueryOptions::default().backoff);
        assert_eq!(options.backoff.init_backoff, Duration::from_millis(100));
        assert_eq!(options.backoff.max_backoff, Duration::from_secs(10));
        assert_eq!(
            options.concurrency_limit,
            QueryOptions::default().concurrency_limit
        );
    }

    #[test]
    fn flags() {
        let config = PartitionedQueryConfig::parse_from([
            "",
            "--concurrency-limit",
            "4",
            "--max-partitions",
            "32",
            "--retry-budget",
            "0",
            "--query-timeout",
            "1m 30s",
            "--retry-initial-backoff",
            "5ms",
            "--on-partial-failure",
            "best-effort",
        ]);
        let options = config.options();

        assert_eq!(options.concurrency_limit.get(), 4);
        assert_eq!(options.max_partitions_hint, NonZeroUsize::new(32));
        assert_eq!(options.retry_budget, 0);
        assert_eq!(options.overall_timeout, Some(Duration::from_secs(90)));
        assert_eq!(options.backoff.init_backoff, Duration::from_millis(5));
        assert_eq!(options.on_partial_failure, FailurePolicy::BestEffort);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = PartitionedQueryConfig::try_parse_from(["", "--concurrency-limit", "0"]);
        assert!(err.is_err());
    }

    #[test]
    fn params_are_bound_to_the_query() {
        let config =
            PartitionedQueryConfig::parse_from(["", "--params", r#"{"region": "eu", "n": 3}"#]);
        let query = config.query("SELECT * FROM t WHERE region = @region LIMIT @n");

        assert_eq!(query.params().get("region"), Some(&Value::from("eu")));
        assert_eq!(query.params().get("n"), Some(&Value::Int64(3)));
    }

    #[test]
    fn params_must_be_a_json_object() {
        assert!(PartitionedQueryConfig::try_parse_from(["", "--params", "[1, 2]"]).is_err());
        assert!(PartitionedQueryConfig::try_parse_from(["", "--params", "{oops"]).is_err());
    }
}
