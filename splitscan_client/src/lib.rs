//! Interface to a range-partitioned SQL database that can split root-partitionable queries into
//! independently readable partitions.
//!
//! The wire protocol lives behind the [`DatabaseClient`] trait; this crate holds the types that
//! cross that boundary: [`Query`], [`ExecutionPlan`], [`SessionHandle`], [`PartitionToken`] and
//! the typed rows returned by a partition read.

pub mod plan;
pub mod query;
pub mod value;

use std::{fmt::Display, num::NonZeroUsize};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use plan::{ExecutionPlan, JoinType, PlanError, PlanNode, PlanNodeKind, RawPlanNode};
pub use query::Query;
pub use value::{Column, ColumnType, QueryParams, Row, Schema, Value, ValueError};

/// Status code attached to every error returned by the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The backend could not be reached
    Unavailable,
    DeadlineExceeded,
    /// The request was throttled
    ResourceExhausted,
    Aborted,
    PermissionDenied,
    InvalidArgument,
    InvalidPartitionToken,
    NotFound,
    Internal,
}

impl ErrorCode {
    /// Whether a request that failed with this code may succeed if sent again
    pub fn is_transient(self) -> bool {
        match self {
            Self::Unavailable
            | Self::DeadlineExceeded
            | Self::ResourceExhausted
            | Self::Aborted => true,
            Self::PermissionDenied
            | Self::InvalidArgument
            | Self::InvalidPartitionToken
            | Self::NotFound
            | Self::Internal => false,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::ResourceExhausted => "resource exhausted",
            Self::Aborted => "aborted",
            Self::PermissionDenied => "permission denied",
            Self::InvalidArgument => "invalid argument",
            Self::InvalidPartitionToken => "invalid partition token",
            Self::NotFound => "not found",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Error returned by a [`DatabaseClient`] request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ClientError {
    code: ErrorCode,
    message: String,
}

impl ClientError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Identifies one partitioned-read session on the database
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A partitioned-read session: a consistent snapshot of the database at `read_timestamp`,
/// served by compute that is isolated from the database's primary workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    id: SessionId,
    read_timestamp: DateTime<Utc>,
}

impl SessionHandle {
    pub fn new(id: SessionId, read_timestamp: DateTime<Utc>) -> Self {
        Self { id, read_timestamp }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn read_timestamp(&self) -> DateTime<Utc> {
        self.read_timestamp
    }
}

/// Opaque handle for one independently readable partition of a query
///
/// A token is only valid within the session that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionToken {
    session: SessionId,
    payload: Vec<u8>,
}

impl PartitionToken {
    pub fn new(session: SessionId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            session,
            payload: payload.into(),
        }
    }

    /// The session that issued this token
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl Display for PartitionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/", self.session)?;
        for b in self.payload.iter().take(8) {
            write!(f, "{b:02x}")?;
        }
        if self.payload.len() > 8 {
            write!(f, "...")?;
        }
        Ok(())
    }
}

/// Rows read from one partition along with the schema reported for them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionRows {
    pub schema: Schema,
    pub rows: Vec<Row>,
}

impl PartitionRows {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }
}

/// The database operations needed to run a query as a set of parallel partition reads
#[async_trait]
pub trait DatabaseClient: std::fmt::Debug + Send + Sync + 'static {
    /// Ask the database to plan `query` without running it
    async fn get_query_plan(&self, query: &Query) -> Result<ExecutionPlan>;

    /// Open a partitioned-read session on data-isolated compute
    async fn begin_partitioned_read(&self) -> Result<SessionHandle>;

    /// Split `query` into partitions that can be read independently within `session`
    ///
    /// `max_partitions_hint` is advisory; the database may return more or fewer tokens.
    async fn partition_query(
        &self,
        session: &SessionHandle,
        query: &Query,
        max_partitions_hint: Option<NonZeroUsize>,
    ) -> Result<Vec<PartitionToken>>;

    /// Read every row of one partition
    async fn execute_partition(
        &self,
        session: &SessionHandle,
        token: &PartitionToken,
    ) -> Result<PartitionRows>;

    /// Release the server-side resources held by `session`
    async fn release_session(&self, session: &SessionHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes() {
        assert!(ClientError::unavailable("down").is_transient());
        assert!(ClientError::new(ErrorCode::ResourceExhausted, "throttled").is_transient());
        assert!(!ClientError::new(ErrorCode::PermissionDenied, "no").is_transient());
        assert!(!ClientError::new(ErrorCode::InvalidPartitionToken, "bad").is_transient());
    }

    #[test]
    fn token_display_truncates_payload() {
        let session = SessionId::new();
        let token = PartitionToken::new(session, vec![0xab; 12]);
        assert_eq!(token.to_string(), format!("{session}/abababababababab..."));
        let token = PartitionToken::new(session, vec![1, 2]);
        assert_eq!(token.to_string(), format!("{session}/0102"));
    }

    #[test]
    fn token_serde_round_trip_keeps_session() {
        let token = PartitionToken::new(SessionId::new(), b"partition-7".to_vec());
        let json = serde_json::to_string(&token).unwrap();
        let back: PartitionToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
        assert_eq!(back.session(), token.session());
    }
}
