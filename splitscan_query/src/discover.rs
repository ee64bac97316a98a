//! Opens partitioned-read sessions and splits queries into partition tokens.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use observability_deps::tracing::{debug, info, warn};
use splitscan_client::{DatabaseClient, ErrorCode, PartitionToken, Query, SessionHandle};

use crate::{Error, Result, inspector::RootPartitionableDecision};

const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// A partitioned-read session held open on the database
///
/// The session must be given back with [`release`](Self::release) once every read using it has
/// finished. A session dropped without being released is released from a background task on the
/// current tokio runtime, if there is one.
#[derive(Debug)]
pub struct PartitionedSession {
    client: Arc<dyn DatabaseClient>,
    handle: SessionHandle,
    release_timeout: Duration,
    released: bool,
}

impl PartitionedSession {
    /// Open a partitioned-read session on `client`
    pub async fn open(client: &Arc<dyn DatabaseClient>) -> Result<Self> {
        let handle = client
            .begin_partitioned_read()
            .await
            .map_err(|e| match e.code() {
                ErrorCode::Unavailable => Error::BackendUnavailable(e),
                _ => Error::PartitionDiscoveryFailed(e),
            })?;
        debug!(session = %handle.id(), "opened partitioned read session");

        Ok(Self {
            client: Arc::clone(client),
            handle,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
            released: false,
        })
    }

    /// Give up on releasing the session if the database has not answered within `timeout`
    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Split `query` into partition tokens bound to this session
    pub async fn partition(
        &self,
        query: &Query,
        max_partitions_hint: Option<NonZeroUsize>,
    ) -> Result<Vec<PartitionToken>> {
        let tokens = self
            .client
            .partition_query(&self.handle, query, max_partitions_hint)
            .await
            .map_err(Error::PartitionDiscoveryFailed)?;
        info!(
            session = %self.handle.id(),
            partitions = tokens.len(),
            max_partitions_hint = max_partitions_hint.map(NonZeroUsize::get),
            "discovered query partitions"
        );
        Ok(tokens)
    }

    /// Release the session's server-side resources
    ///
    /// Failures are logged rather than returned: the session is unusable either way and the
    /// outcome of the query does not depend on it. A release still unanswered after the release
    /// timeout is abandoned.
    pub async fn release(mut self) {
        self.released = true;
        let release_timeout = self.release_timeout;
        let release = self.client.release_session(&self.handle);
        match tokio::time::timeout(release_timeout, release).await {
            Ok(Ok(())) => debug!(session = %self.handle.id(), "released partitioned read session"),
            Ok(Err(e)) => warn!(
                session = %self.handle.id(),
                error = %e,
                "failed to release partitioned read session"
            ),
            Err(_) => warn!(
                session = %self.handle.id(),
                ?release_timeout,
                "partitioned read session release did not complete in time, abandoning it"
            ),
        }
    }
}

impl Drop for PartitionedSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        warn!(
            session = %self.handle.id(),
            "partitioned read session dropped before release"
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let client = Arc::clone(&self.client);
            let handle = self.handle;
            runtime.spawn(async move {
                if let Err(e) = client.release_session(&handle).await {
                    warn!(
                        session = %handle.id(),
                        error = %e,
                        "failed to release dropped partitioned read session"
                    );
                }
            });
        }
    }
}

/// Fail with [`Error::NotPartitionable`] unless `decision` accepts the query
pub(crate) fn ensure_partitionable(decision: &RootPartitionableDecision) -> Result<()> {
    if decision.is_partitionable {
        return Ok(());
    }
    Err(Error::NotPartitionable {
        reason: decision
            .reason
            .clone()
            .unwrap_or_else(|| "query plan is not root-partitionable".to_string()),
    })
}

/// Open a partitioned-read session and split `query` into partition tokens
///
/// `decision` must come from [`inspect`](crate::inspector::inspect) for the same query; a query
/// that is not root-partitionable fails with [`Error::NotPartitionable`] before the database is
/// contacted. If splitting the query fails, the session is released before the error is
/// returned.
pub async fn discover(
    client: &Arc<dyn DatabaseClient>,
    query: &Query,
    decision: &RootPartitionableDecision,
    max_partitions_hint: Option<NonZeroUsize>,
) -> Result<(PartitionedSession, Vec<PartitionToken>)> {
    ensure_partitionable(decision)?;

    let session = PartitionedSession::open(client).await?;
    match session.partition(query, max_partitions_hint).await {
        Ok(tokens) => Ok((session, tokens)),
        Err(e) => {
            session.release().await;
            Err(e)
        }
    }
}
