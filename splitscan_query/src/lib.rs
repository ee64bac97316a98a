//! Runs SQL queries against a range-partitioned database by splitting them into independently
//! readable partitions, reading those partitions in parallel on isolated compute, and stitching
//! the rows back together into one [`ResultSet`].
//!
//! Only root-partitionable queries are accepted: queries whose plan has a distributed union at
//! its root, so that the concatenation of every partition's rows is exactly the query's result.
//!
//! ```text
//! inspect ──► discover ──► execute ──► assemble
//!  (plan)     (tokens)     (rows per    (one result
//!                           partition)   set)
//! ```

pub mod assemble;
pub mod discover;
pub mod executor;
pub mod inspector;
pub mod result_set;

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use arrow::record_batch::RecordBatch;
use observability_deps::tracing::{info, warn};
use splitscan_client::{ClientError, DatabaseClient, PartitionToken, Query};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use assemble::assemble;
pub use backoff::BackoffConfig;
pub use discover::{PartitionedSession, discover};
pub use executor::{PartitionError, PartitionExecutor, PartitionResult};
pub use inspector::{RootPartitionableDecision, inspect};
pub use result_set::{ConversionError, ResultSet};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query is not root-partitionable: {reason}")]
    NotPartitionable { reason: String },

    #[error("database unavailable: {0}")]
    BackendUnavailable(#[source] ClientError),

    #[error("failed to inspect query plan: {reason}")]
    PlanInspectionFailed {
        reason: String,
        #[source]
        source: Option<ClientError>,
    },

    #[error("failed to discover query partitions: {0}")]
    PartitionDiscoveryFailed(#[source] ClientError),

    #[error("partition {partition} does not match the result schema: {reason}")]
    SchemaMismatch { partition: usize, reason: String },

    #[error(
        "partition {partition} ({token}) failed: {source} ({other_failures} other partition(s) also failed)"
    )]
    PartialFailure {
        partition: usize,
        token: Arc<PartitionToken>,
        #[source]
        source: PartitionError,
        other_failures: usize,
    },

    #[error("query was cancelled")]
    Cancelled,

    #[error("query did not complete within {0:?}")]
    Timeout(Duration),

    #[error("failed to convert query result: {0}")]
    Conversion(#[from] ConversionError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What to do when some partitions fail after the retry budget is spent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Fail the whole query with [`Error::PartialFailure`]
    #[default]
    Abort,
    /// Return the rows of the partitions that succeeded and count the ones that did not
    BestEffort,
}

/// Tuning for one partitioned query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Maximum number of partitions read at the same time
    pub concurrency_limit: NonZeroUsize,
    /// Advisory upper bound on the number of partitions the database splits the query into
    pub max_partitions_hint: Option<NonZeroUsize>,
    /// Number of times a transiently failing partition read is retried
    pub retry_budget: usize,
    /// Bound on the time from query start until every partition has been read
    pub overall_timeout: Option<Duration>,
    pub on_partial_failure: FailurePolicy,
    pub backoff: BackoffConfig,
    /// How long stopped reads get to wind down after cancellation or timeout
    pub shutdown_timeout: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            max_partitions_hint: None,
            retry_budget: 5,
            overall_timeout: None,
            on_partial_failure: FailurePolicy::default(),
            backoff: BackoffConfig {
                init_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(10),
                base: 3.,
                ..Default::default()
            },
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl QueryOptions {
    pub fn with_concurrency_limit(mut self, concurrency_limit: NonZeroUsize) -> Self {
        self.concurrency_limit = concurrency_limit;
        self
    }

    pub fn with_max_partitions_hint(mut self, max_partitions_hint: NonZeroUsize) -> Self {
        self.max_partitions_hint = Some(max_partitions_hint);
        self
    }

    pub fn with_retry_budget(mut self, retry_budget: usize) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn with_overall_timeout(mut self, overall_timeout: Duration) -> Self {
        self.overall_timeout = Some(overall_timeout);
        self
    }

    pub fn with_failure_policy(mut self, on_partial_failure: FailurePolicy) -> Self {
        self.on_partial_failure = on_partial_failure;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

/// Run `query` as a set of parallel partition reads and return the combined rows
///
/// The session opened for the query is released exactly once whichever way the query ends, and
/// that release has finished, or been abandoned after `shutdown_timeout`, before this returns.
pub async fn run_partitioned_query(
    client: Arc<dyn DatabaseClient>,
    query: &Query,
    options: QueryOptions,
    cancel: CancellationToken,
) -> Result<ResultSet> {
    let start = Instant::now();
    let deadline = options.overall_timeout.map(|timeout| start + timeout);
    let timeout = options.overall_timeout.unwrap_or_default();

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    info!(
        sql = query.sql(),
        params = query.params().len(),
        concurrency_limit = options.concurrency_limit.get(),
        "starting partitioned query"
    );

    let decision = tokio::select! {
        biased;
        e = interrupted(&cancel, deadline, timeout) => return Err(e),
        decision = inspect(client.as_ref(), query) => decision?,
    };
    discover::ensure_partitionable(&decision)?;

    let session = tokio::select! {
        biased;
        e = interrupted(&cancel, deadline, timeout) => return Err(e),
        session = PartitionedSession::open(&client) => session?,
    };
    let session = session.with_release_timeout(options.shutdown_timeout);

    let partitioned = tokio::select! {
        biased;
        e = interrupted(&cancel, deadline, timeout) => Err(e),
        tokens = session.partition(query, options.max_partitions_hint) => tokens,
    };
    let tokens = match partitioned {
        Ok(tokens) => tokens,
        Err(e) => {
            session.release().await;
            return Err(e);
        }
    };

    let partitions = tokens.len();
    let mut executor = PartitionExecutor::new(Arc::clone(&client), options.clone());
    if let Some(deadline) = deadline {
        executor = executor.with_deadline(deadline);
    }
    let results = executor.execute(session.handle(), tokens, &cancel).await;
    session.release().await;

    let result_set = assemble(&results?, options.on_partial_failure)?;
    if result_set.failed_partitions() > 0 {
        warn!(
            failed_partitions = result_set.failed_partitions(),
            partitions, "returning rows from the partitions that succeeded"
        );
    }
    info!(
        partitions,
        rows = result_set.num_rows(),
        columns = result_set.schema().len(),
        elapsed = ?start.elapsed(),
        "partitioned query complete"
    );
    Ok(result_set)
}

/// Completes once `cancel` fires or `deadline` passes, with the error the query stops with
async fn interrupted(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    timeout: Duration,
) -> Error {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Error::Cancelled,
        _ = executor::sleep_until_deadline(deadline) => Error::Timeout(timeout),
    }
}

/// A database client paired with the options used for every query run through it
#[derive(Debug, Clone)]
pub struct PartitionedQuery {
    client: Arc<dyn DatabaseClient>,
    options: QueryOptions,
}

impl PartitionedQuery {
    pub fn new(client: Arc<dyn DatabaseClient>, options: QueryOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub async fn execute(&self, query: &Query, cancel: CancellationToken) -> Result<ResultSet> {
        run_partitioned_query(Arc::clone(&self.client), query, self.options.clone(), cancel).await
    }

    pub async fn execute_sql(&self, sql: &str) -> Result<ResultSet> {
        self.execute(&Query::new(sql), CancellationToken::new()).await
    }

    /// Run `query` and convert the combined rows into a single Arrow batch
    pub async fn execute_to_record_batch(
        &self,
        query: &Query,
        cancel: CancellationToken,
    ) -> Result<RecordBatch> {
        Ok(self.execute(query, cancel).await?.to_record_batch()?)
    }
}
