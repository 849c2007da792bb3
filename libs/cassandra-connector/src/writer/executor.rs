use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::batch::Statement;
use super::metrics::WriterMetrics;
use crate::common::{ConnectorError, ConnectorResult};
use crate::cql::SessionHandle;

/// Counters of one executor, final after [`AsyncQueryExecutor::drain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Highest number of statements that were in flight at once
    pub max_outstanding: usize,
}

#[derive(Default)]
struct ExecutionCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
}

impl ExecutionCounters {
    fn snapshot(&self) -> ExecutionStats {
        ExecutionStats {
            submitted: self.submitted.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            max_outstanding: self.max_outstanding.load(Ordering::SeqCst),
        }
    }
}

/// Dispatches statements with at most `parallelism` of them in flight
///
/// `execute_async` waits for a free slot, then runs the statement on its own
/// task. Failures are counted and logged but never stop other statements.
pub struct AsyncQueryExecutor<S: SessionHandle> {
    session: Arc<S>,
    permits: Arc<Semaphore>,
    parallelism: usize,
    counters: Arc<ExecutionCounters>,
    metrics: Option<WriterMetrics>,
}

impl<S: SessionHandle> AsyncQueryExecutor<S> {
    /// `parallelism` is clamped to at least one
    pub fn new(session: Arc<S>, parallelism: usize) -> Self {
        let parallelism = parallelism.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize));
        Self {
            session,
            permits: Arc::new(Semaphore::new(parallelism)),
            parallelism,
            counters: Arc::new(ExecutionCounters::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: WriterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Submit a statement, suspending while `parallelism` statements are in flight
    ///
    /// Returns once the statement has been handed to its task; the outcome is
    /// only visible through the counters.
    pub async fn execute_async(&self, statement: Statement<S::Prepared>) -> ConnectorResult<()> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ConnectorError::Internal("executor semaphore closed".to_string()))?;

        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        let outstanding = self.counters.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .max_outstanding
            .fetch_max(outstanding, Ordering::SeqCst);
        if let Some(metrics) = &self.metrics {
            metrics.in_flight(outstanding);
        }

        let completion = Completion {
            counters: Arc::clone(&self.counters),
            metrics: self.metrics.clone(),
            rows: statement.row_count(),
            bytes: statement.bytes_count(),
            outcome: None,
            _permit: permit,
        };
        let session = Arc::clone(&self.session);

        tokio::spawn(async move {
            // the guard lives in the task so the slot stays taken until it ends
            let mut completion = completion;
            let result = session.execute(statement).await;
            if let Err(e) = &result {
                warn!(error = %e, rows = completion.rows, "Statement failed");
            }
            completion.outcome = Some(result.is_ok());
        });

        Ok(())
    }

    /// Wait until every submitted statement has settled
    ///
    /// The executor stays usable afterwards.
    pub async fn drain(&self) -> ConnectorResult<ExecutionStats> {
        let permits = u32::try_from(self.parallelism)
            .map_err(|_| ConnectorError::Internal("parallelism exceeds u32".to_string()))?;
        let _all = self
            .permits
            .acquire_many(permits)
            .await
            .map_err(|_| ConnectorError::Internal("executor semaphore closed".to_string()))?;

        let stats = self.counters.snapshot();
        debug!(
            submitted = stats.submitted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Executor drained"
        );
        Ok(stats)
    }

    /// Counters so far, without waiting
    pub fn stats(&self) -> ExecutionStats {
        self.counters.snapshot()
    }
}

/// Records the outcome of one statement and then frees its slot
///
/// A task that panics drops this without an outcome, which counts as a
/// failure.
struct Completion {
    counters: Arc<ExecutionCounters>,
    metrics: Option<WriterMetrics>,
    rows: usize,
    bytes: usize,
    outcome: Option<bool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let succeeded = self.outcome == Some(true);
        if succeeded {
            self.counters.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
        }
        let outstanding = self.counters.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;

        if let Some(metrics) = &self.metrics {
            if succeeded {
                metrics.statement_succeeded(self.rows, self.bytes);
            } else {
                metrics.statement_failed();
            }
            metrics.in_flight(outstanding);
        }
    }
}
