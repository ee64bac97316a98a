//! Parallel partition reads.
//!
//! One task is spawned per partition token and a semaphore bounds how many of them are reading
//! at once. Tasks report back their dispatch index so the results come out in token order no
//! matter which partition finishes first.

use std::{ops::ControlFlow, panic::AssertUnwindSafe, sync::Arc};

use backoff::{Backoff, BackoffConfig};
use futures::FutureExt;
use observability_deps::tracing::{debug, info, warn};
use splitscan_client::{
    ClientError, DatabaseClient, PartitionRows, PartitionToken, SessionHandle, SessionId,
};
use tokio::{
    sync::Semaphore,
    task::JoinSet,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

use crate::{Error, QueryOptions, Result};

/// Why a single partition produced no rows
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("partition read failed after {attempts} attempt(s): {source}")]
    ReadFailed {
        attempts: usize,
        #[source]
        source: ClientError,
    },

    #[error("partition token was issued by session {token_session}, not {session}")]
    InvalidPartitionToken {
        token_session: SessionId,
        session: SessionId,
    },

    #[error("partition read was cancelled")]
    Cancelled,

    #[error("partition read task failed: {0}")]
    TaskFailed(String),
}

/// Outcome of reading the partition at dispatch position `index`
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionResult {
    pub index: usize,
    pub token: Arc<PartitionToken>,
    pub outcome: Result<PartitionRows, PartitionError>,
}

impl PartitionResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Reads every partition of a session concurrently
#[derive(Debug)]
pub struct PartitionExecutor {
    client: Arc<dyn DatabaseClient>,
    options: QueryOptions,
    deadline: Option<Instant>,
}

impl PartitionExecutor {
    pub fn new(client: Arc<dyn DatabaseClient>, options: QueryOptions) -> Self {
        Self {
            client,
            options,
            deadline: None,
        }
    }

    /// Stop reading at `deadline` rather than `overall_timeout` after [`execute`] is called
    ///
    /// [`execute`]: Self::execute
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Read every partition in `tokens`, returning one [`PartitionResult`] per token in token
    /// order
    ///
    /// A failed partition does not stop its siblings. The whole call fails with
    /// [`Error::Cancelled`] if `cancel` fires, or [`Error::Timeout`] if the deadline passes; in
    /// both cases queued reads are abandoned, in-flight reads are stopped and the call waits up
    /// to `shutdown_timeout` for every task to finish before returning.
    pub async fn execute(
        &self,
        session: &SessionHandle,
        tokens: Vec<PartitionToken>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PartitionResult>> {
        let tokens: Vec<Arc<PartitionToken>> = tokens.into_iter().map(Arc::new).collect();
        let mut slots: Vec<Option<PartitionResult>> = (0..tokens.len()).map(|_| None).collect();

        let deadline = self.deadline.or_else(|| {
            self.options
                .overall_timeout
                .map(|timeout| Instant::now() + timeout)
        });

        debug!(
            session = %session.id(),
            partitions = tokens.len(),
            concurrency_limit = self.options.concurrency_limit.get(),
            "dispatching partition reads"
        );

        let stop = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency_limit.get()));
        let mut tasks = JoinSet::new();
        for (index, token) in tokens.iter().enumerate() {
            let read = PartitionRead {
                client: Arc::clone(&self.client),
                session: *session,
                index,
                token: Arc::clone(token),
                retry_budget: self.options.retry_budget,
                backoff: self.options.backoff.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            let stop = stop.clone();
            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(read.run(semaphore, stop))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(PartitionError::TaskFailed("task panicked".into())));
                (index, outcome)
            });
        }

        let interrupted = {
            let expired = sleep_until_deadline(deadline);
            tokio::pin!(expired);
            loop {
                tokio::select! {
                    joined = tasks.join_next() => match joined {
                        Some(Ok((index, outcome))) => {
                            slots[index] = Some(PartitionResult {
                                index,
                                token: Arc::clone(&tokens[index]),
                                outcome,
                            });
                        }
                        Some(Err(e)) => warn!(error = %e, "partition read task did not complete"),
                        None => break None,
                    },
                    _ = cancel.cancelled() => break Some(Error::Cancelled),
                    _ = &mut expired => {
                        let timeout = self.options.overall_timeout.unwrap_or_default();
                        break Some(Error::Timeout(timeout));
                    }
                }
            }
        };

        if let Some(e) = interrupted {
            stop.cancel();
            self.shut_down(&mut tasks).await;
            info!(error = %e, "partition reads stopped");
            return Err(e);
        }

        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| PartitionResult {
                    index,
                    token: Arc::clone(&tokens[index]),
                    outcome: Err(PartitionError::TaskFailed(
                        "task exited without a result".into(),
                    )),
                })
            })
            .collect())
    }

    /// Wait for stopped tasks to settle, aborting any still running after `shutdown_timeout`
    async fn shut_down(&self, tasks: &mut JoinSet<(usize, Result<PartitionRows, PartitionError>)>) {
        let shutdown_timeout = self.options.shutdown_timeout;
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                ?shutdown_timeout,
                remaining = tasks.len(),
                "partition reads did not stop in time, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

/// Completes at `deadline`, or never if there is none
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct PartitionRead {
    client: Arc<dyn DatabaseClient>,
    session: SessionHandle,
    index: usize,
    token: Arc<PartitionToken>,
    retry_budget: usize,
    backoff: BackoffConfig,
}

impl PartitionRead {
    async fn run(
        self,
        semaphore: Arc<Semaphore>,
        stop: CancellationToken,
    ) -> Result<PartitionRows, PartitionError> {
        if self.token.session() != self.session.id() {
            return Err(PartitionError::InvalidPartitionToken {
                token_session: self.token.session(),
                session: self.session.id(),
            });
        }

        let _permit = tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(PartitionError::Cancelled),
            permit = semaphore.acquire_owned() => permit.map_err(|_| PartitionError::Cancelled)?,
        };

        tokio::select! {
            biased;
            _ = stop.cancelled() => Err(PartitionError::Cancelled),
            res = self.read_with_retry() => res,
        }
    }

    async fn read_with_retry(&self) -> Result<PartitionRows, PartitionError> {
        let mut attempts = 0;
        let outcome = Backoff::new(&self.backoff)
            .retry_with_backoff("read partition", || {
                attempts += 1;
                self.attempt(attempts)
            })
            .await
            .unwrap_or_else(|e| Err(PartitionError::TaskFailed(e.to_string())));

        match &outcome {
            Ok(rows) => debug!(
                partition = self.index,
                attempts,
                rows = rows.rows.len(),
                "partition read complete"
            ),
            Err(e) => warn!(
                partition = self.index,
                attempts,
                error = %e,
                "partition read failed"
            ),
        }
        outcome
    }

    /// Read the partition once, continuing only on a transient error within the retry budget
    async fn attempt(
        &self,
        attempt: usize,
    ) -> ControlFlow<Result<PartitionRows, PartitionError>, ClientError> {
        match self
            .client
            .execute_partition(&self.session, &self.token)
            .await
        {
            Ok(rows) => ControlFlow::Break(Ok(rows)),
            Err(e) if e.is_transient() && attempt <= self.retry_budget => {
                warn!(
                    partition = self.index,
                    attempt,
                    retry_budget = self.retry_budget,
                    error = %e,
                    "transient partition read failure, retrying"
                );
                ControlFlow::Continue(e)
            }
            Err(source) => ControlFlow::Break(Err(PartitionError::ReadFailed {
                attempts: attempt,
                source,
            })),
        }
    }
}
