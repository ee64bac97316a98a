//! In-memory [`DatabaseClient`] for exercising partitioned queries in tests.
//!
//! A [`MockDatabase`] is configured with the plan to return for each SQL string and the
//! partitions to split it into. Each partition can be slowed down, made to fail a number of
//! times, or made to never finish, and the database records every request it receives so tests
//! can assert on retries, concurrency and session lifetimes.

use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    ops::Range,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use splitscan_client::{
    ClientError, ColumnType, DatabaseClient, ErrorCode, ExecutionPlan, PartitionRows,
    PartitionToken, PlanNode, PlanNodeKind, Query, Result, Row, Schema, SessionHandle, SessionId,
    Value,
};

/// A single-column `INT64` schema
pub fn int_schema(name: &str) -> Schema {
    Schema::from_iter([(name.to_string(), ColumnType::Int64)])
}

/// One single-column row per value in `range`
pub fn int_rows(range: Range<i64>) -> Vec<Row> {
    range.map(|i| vec![Value::Int64(i)]).collect()
}

/// A root-partitionable plan scanning `table`
pub fn distributed_scan(table: &str) -> PlanNode {
    PlanNode::new(PlanNodeKind::DistributedUnion).with_child(
        PlanNode::new(PlanNodeKind::SerializeResult).with_child(PlanNode::scan(table)),
    )
}

/// One partition served by a [`MockDatabase`]
#[derive(Debug, Clone)]
pub struct MockPartition {
    rows: PartitionRows,
    latency: Duration,
    failures: usize,
    error: Option<ClientError>,
    hang: bool,
}

impl MockPartition {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self {
            rows: PartitionRows::new(schema, rows),
            latency: Duration::ZERO,
            failures: 0,
            error: None,
            hang: false,
        }
    }

    /// Wait `latency` before answering each read
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the first `n` reads with `error`
    pub fn fail_first(mut self, n: usize, error: ClientError) -> Self {
        self.failures = n;
        self.error = Some(error);
        self
    }

    /// Never answer a read
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

#[derive(Debug, Default)]
struct State {
    plans: HashMap<String, Result<ExecutionPlan>>,
    /// Partitions per SQL string, along with how often each has been read
    partitions: BTreeMap<String, Vec<(MockPartition, usize)>>,

    begin_error: Option<ClientError>,
    partition_query_error: Option<ClientError>,
    release_error: Option<ClientError>,
    release_hang: bool,
    plan_latency: Duration,
    partition_query_latency: Duration,

    /// Open sessions and the SQL they were partitioned for, if any
    sessions: HashMap<SessionId, Option<String>>,
    opened_sessions: Vec<SessionId>,
    released_sessions: Vec<SessionId>,

    plan_requests: usize,
    partition_query_calls: usize,
    max_partitions_hints: Vec<Option<NonZeroUsize>>,
    in_flight: usize,
    peak_concurrency: usize,
}

/// A [`DatabaseClient`] answering from in-memory plans and partitions
///
/// SQL strings given partitions but no plan are planned as a distributed scan; any other SQL
/// without a plan is rejected as invalid.
#[derive(Debug, Default)]
pub struct MockDatabase {
    state: Mutex<State>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(self, sql: &str, root: PlanNode) -> Self {
        self.with_plan_result(sql, Ok(ExecutionPlan::new(root)))
    }

    pub fn with_plan_result(self, sql: &str, plan: Result<ExecutionPlan>) -> Self {
        self.state.lock().plans.insert(sql.to_string(), plan);
        self
    }

    /// Split `sql` into `partitions`, in order
    pub fn with_partitions(self, sql: &str, partitions: Vec<MockPartition>) -> Self {
        self.state.lock().partitions.insert(
            sql.to_string(),
            partitions.into_iter().map(|p| (p, 0)).collect(),
        );
        self
    }

    /// Fail every attempt to open a session
    pub fn with_begin_error(self, error: ClientError) -> Self {
        self.state.lock().begin_error = Some(error);
        self
    }

    /// Fail every attempt to split a query into partitions
    pub fn with_partition_query_error(self, error: ClientError) -> Self {
        self.state.lock().partition_query_error = Some(error);
        self
    }

    /// Fail every attempt to release a session
    pub fn with_release_error(self, error: ClientError) -> Self {
        self.state.lock().release_error = Some(error);
        self
    }

    /// Wait `latency` before answering each plan request
    pub fn with_plan_latency(self, latency: Duration) -> Self {
        self.state.lock().plan_latency = latency;
        self
    }

    /// Wait `latency` before answering each request to split a query into partitions
    pub fn with_partition_query_latency(self, latency: Duration) -> Self {
        self.state.lock().partition_query_latency = latency;
        self
    }

    /// Record release requests but never answer them
    pub fn with_release_hang(self) -> Self {
        self.state.lock().release_hang = true;
        self
    }

    pub fn plan_requests(&self) -> usize {
        self.state.lock().plan_requests
    }

    pub fn partition_query_calls(&self) -> usize {
        self.state.lock().partition_query_calls
    }

    /// The partition count hint passed with each partition request
    pub fn max_partitions_hints(&self) -> Vec<Option<NonZeroUsize>> {
        self.state.lock().max_partitions_hints.clone()
    }

    /// Every session opened, in order
    pub fn opened_sessions(&self) -> Vec<SessionId> {
        self.state.lock().opened_sessions.clone()
    }

    /// Every release request received, in order, including repeated ones
    pub fn released_sessions(&self) -> Vec<SessionId> {
        self.state.lock().released_sessions.clone()
    }

    /// Number of reads of each partition, ordered by SQL string and then partition
    pub fn partition_attempts(&self) -> Vec<usize> {
        self.state
            .lock()
            .partitions
            .values()
            .flatten()
            .map(|(_, attempts)| *attempts)
            .collect()
    }

    /// Partition reads currently in progress
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Most partition reads ever in progress at once
    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().peak_concurrency
    }

    /// Record a read of the partition `token` refers to and return what it should do
    fn start_read(
        &self,
        session: &SessionHandle,
        token: &PartitionToken,
    ) -> Result<(MockPartition, usize)> {
        let mut state = self.state.lock();
        let sql = match state.sessions.get(&session.id()) {
            Some(Some(sql)) if token.session() == session.id() => sql.clone(),
            _ => {
                return Err(ClientError::new(
                    ErrorCode::InvalidPartitionToken,
                    format!("token {token} is not valid for session {}", session.id()),
                ));
            }
        };

        let index = <[u8; 8]>::try_from(token.payload())
            .map(u64::from_le_bytes)
            .ok()
            .and_then(|i| usize::try_from(i).ok());
        let (partition, attempts) = index
            .and_then(|i| state.partitions.get_mut(&sql)?.get_mut(i))
            .ok_or_else(|| {
                ClientError::new(
                    ErrorCode::InvalidPartitionToken,
                    format!("token {token} does not name a partition"),
                )
            })?;
        *attempts += 1;
        let read = (partition.clone(), *attempts);

        state.in_flight += 1;
        state.peak_concurrency = state.peak_concurrency.max(state.in_flight);
        Ok(read)
    }
}

/// Counts a read as in flight until dropped
struct InFlight<'a>(&'a MockDatabase);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.state.lock().in_flight -= 1;
    }
}

#[async_trait]
impl DatabaseClient for MockDatabase {
    async fn get_query_plan(&self, query: &Query) -> Result<ExecutionPlan> {
        let (plan, latency) = {
            let mut state = self.state.lock();
            state.plan_requests += 1;
            let plan = match state.plans.get(query.sql()) {
                Some(plan) => plan.clone(),
                None if state.partitions.contains_key(query.sql()) => {
                    Ok(ExecutionPlan::new(distributed_scan("t")))
                }
                None => Err(ClientError::invalid_argument(format!(
                    "syntax error in '{}'",
                    query.sql()
                ))),
            };
            (plan, state.plan_latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        plan
    }

    async fn begin_partitioned_read(&self) -> Result<SessionHandle> {
        let mut state = self.state.lock();
        if let Some(e) = &state.begin_error {
            return Err(e.clone());
        }
        let id = SessionId::new();
        state.sessions.insert(id, None);
        state.opened_sessions.push(id);
        Ok(SessionHandle::new(id, Utc::now()))
    }

    async fn partition_query(
        &self,
        session: &SessionHandle,
        query: &Query,
        max_partitions_hint: Option<NonZeroUsize>,
    ) -> Result<Vec<PartitionToken>> {
        let latency = {
            let mut state = self.state.lock();
            state.partition_query_calls += 1;
            state.max_partitions_hints.push(max_partitions_hint);
            state.partition_query_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if let Some(e) = &state.partition_query_error {
            return Err(e.clone());
        }

        let partitions = state
            .partitions
            .get(query.sql())
            .map(Vec::len)
            .unwrap_or_default();
        let Some(bound) = state.sessions.get_mut(&session.id()) else {
            return Err(ClientError::new(
                ErrorCode::NotFound,
                format!("session {} is not open", session.id()),
            ));
        };
        *bound = Some(query.sql().to_string());

        Ok((0..partitions as u64)
            .map(|i| PartitionToken::new(session.id(), i.to_le_bytes()))
            .collect())
    }

    async fn execute_partition(
        &self,
        session: &SessionHandle,
        token: &PartitionToken,
    ) -> Result<PartitionRows> {
        let (partition, attempt) = self.start_read(session, token)?;
        let _in_flight = InFlight(self);
        debug!(%token, attempt, "mock partition read");

        if partition.hang {
            std::future::pending::<()>().await;
        }
        if !partition.latency.is_zero() {
            tokio::time::sleep(partition.latency).await;
        }
        match partition.error {
            Some(e) if attempt <= partition.failures => Err(e),
            _ => Ok(partition.rows),
        }
    }

    async fn release_session(&self, session: &SessionHandle) -> Result<()> {
        let hang = {
            let mut state = self.state.lock();
            state.released_sessions.push(session.id());
            state.release_hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        if let Some(e) = &state.release_error {
            return Err(e.clone());
        }
        match state.sessions.remove(&session.id()) {
            Some(_) => Ok(()),
            None => Err(ClientError::new(
                ErrorCode::NotFound,
                format!("session {} is not open", session.id()),
            )),
        }
    }
}
