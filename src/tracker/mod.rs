//! Async operation tracking
//!
//! Mutating provider calls answer with a job id and finish later. The
//! tracker polls every still-pending job once per sweep (concurrently), waits
//! `interval` between sweeps and gives each job `timeout` of wall-clock time
//! measured from its own submission.

use crate::client::ApiError;
use crate::observability::Metrics;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Answer to a single status poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Pending,
    Succeeded(Value),
    Failed(String),
}

/// Status lookup for one job
#[async_trait]
pub trait JobPoller: Send + Sync {
    async fn poll(&self, job_id: &str) -> Result<PollOutcome, ApiError>;
}

#[async_trait]
impl<P: JobPoller + ?Sized> JobPoller for Arc<P> {
    async fn poll(&self, job_id: &str) -> Result<PollOutcome, ApiError> {
        (**self).poll(job_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationState::Pending)
    }
}

/// Terminal result of a tracked operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Succeeded(Value),
    Failed(String),
    TimedOut { elapsed: Duration },
}

impl OperationResult {
    pub fn state(&self) -> OperationState {
        match self {
            OperationResult::Succeeded(_) => OperationState::Succeeded,
            OperationResult::Failed(_) => OperationState::Failed,
            OperationResult::TimedOut { .. } => OperationState::TimedOut,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, OperationResult::Succeeded(_))
    }

    /// Result payload of a succeeded operation
    pub fn payload(&self) -> Option<&Value> {
        match self {
            OperationResult::Succeeded(payload) => Some(payload),
            _ => None,
        }
    }
}

/// A job handed to the tracker
#[derive(Debug, Clone)]
pub struct AsyncOperation {
    job_id: String,
    submitted_at: Instant,
    result: Option<OperationResult>,
}

impl AsyncOperation {
    /// Operation submitted just now
    pub fn new(job_id: impl Into<String>) -> Self {
        Self::submitted_at(job_id, Instant::now())
    }

    pub fn submitted_at(job_id: impl Into<String>, submitted_at: Instant) -> Self {
        Self {
            job_id: job_id.into(),
            submitted_at,
            result: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn submission_time(&self) -> Instant {
        self.submitted_at
    }

    pub fn state(&self) -> OperationState {
        self.result
            .as_ref()
            .map_or(OperationState::Pending, OperationResult::state)
    }

    pub fn result(&self) -> Option<&OperationResult> {
        self.result.as_ref()
    }

    fn deadline(&self, timeout: Duration) -> Instant {
        self.submitted_at + timeout
    }

    /// Record the terminal result; a terminal operation keeps its first one
    fn resolve(&mut self, result: OperationResult) {
        if self.result.is_none() {
            self.result = Some(result);
        }
    }

    fn into_result(self) -> Option<(String, OperationResult)> {
        let job_id = self.job_id;
        self.result.map(|result| (job_id, result))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Pause between sweeps
    pub interval: Duration,
    /// Per-operation budget, counted from submission
    pub timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Snapshot handed to the progress callback after each sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepProgress {
    pub sweep: u32,
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl SweepProgress {
    fn record(&mut self, result: &OperationResult) {
        match result.state() {
            OperationState::Succeeded => self.succeeded += 1,
            OperationState::Failed => self.failed += 1,
            OperationState::TimedOut => self.timed_out += 1,
            OperationState::Pending => {}
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracking cancelled with {} operation(s) still pending", .pending.len())]
    Cancelled {
        resolved: BTreeMap<String, OperationResult>,
        pending: Vec<String>,
    },
}

/// Polls async jobs to a terminal state
pub struct OperationTracker<P> {
    poller: P,
    config: TrackerConfig,
    cancel: CancellationToken,
    metrics: Option<Arc<Metrics>>,
}

impl<P: JobPoller> OperationTracker<P> {
    pub fn new(poller: P, config: TrackerConfig) -> Self {
        Self {
            poller,
            config,
            cancel: CancellationToken::new(),
            metrics: None,
        }
    }

    /// Abort waiting when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Track job ids submitted just now
    pub async fn await_jobs<I, S, F>(
        &self,
        job_ids: I,
        progress: F,
    ) -> Result<BTreeMap<String, OperationResult>, TrackerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnMut(&SweepProgress),
    {
        let now = Instant::now();
        let operations = job_ids
            .into_iter()
            .map(|id| AsyncOperation::submitted_at(id, now))
            .collect();
        self.await_all(operations, progress).await
    }

    /// Wait until every operation is terminal
    ///
    /// Returns one result per distinct job id. Duplicate job ids are tracked
    /// once. On cancellation the results gathered so far come back inside
    /// `TrackerError::Cancelled`.
    pub async fn await_all<F>(
        &self,
        operations: Vec<AsyncOperation>,
        mut progress: F,
    ) -> Result<BTreeMap<String, OperationResult>, TrackerError>
    where
        F: FnMut(&SweepProgress),
    {
        let mut seen = HashSet::new();
        let mut pending: Vec<AsyncOperation> = operations
            .into_iter()
            .filter(|op| seen.insert(op.job_id.clone()))
            .collect();
        let mut resolved = BTreeMap::new();
        let mut counts = SweepProgress::default();

        info!(operations = pending.len(), "Tracking async operations");

        loop {
            self.expire(&mut pending, &mut resolved, &mut counts);
            if pending.is_empty() {
                break;
            }

            counts.sweep += 1;
            let sweep = counts.sweep;

            let polls = join_all(pending.iter().map(|op| self.poll_once(&op.job_id)));
            let outcomes = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(cancelled(resolved, &pending));
                }
                outcomes = polls => outcomes,
            };

            for (op, outcome) in pending.iter_mut().zip(outcomes) {
                match outcome {
                    Some(PollOutcome::Succeeded(payload)) => {
                        debug!(job_id = %op.job_id, sweep, "Operation succeeded");
                        op.resolve(OperationResult::Succeeded(payload));
                    }
                    Some(PollOutcome::Failed(reason)) => {
                        warn!(job_id = %op.job_id, sweep, reason = %reason, "Operation failed");
                        op.resolve(OperationResult::Failed(reason));
                    }
                    Some(PollOutcome::Pending) | None => {}
                }
            }

            self.collect_terminal(&mut pending, &mut resolved, &mut counts);
            counts.pending = pending.len();
            progress(&counts);

            debug!(
                sweep,
                pending = counts.pending,
                succeeded = counts.succeeded,
                failed = counts.failed,
                timed_out = counts.timed_out,
                "Sweep complete"
            );

            if pending.is_empty() {
                break;
            }

            // Sleep one interval, but wake early for the nearest deadline
            let now = Instant::now();
            let next_deadline = pending
                .iter()
                .map(|op| op.deadline(self.config.timeout))
                .min()
                .unwrap_or(now);
            let wake_at = (now + self.config.interval).min(next_deadline.max(now));

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(cancelled(resolved, &pending));
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }

        info!(
            succeeded = counts.succeeded,
            failed = counts.failed,
            timed_out = counts.timed_out,
            sweeps = counts.sweep,
            "Async operations settled"
        );

        Ok(resolved)
    }

    /// One poll
    ///
    /// Transient errors read as "still pending". Any other error fails the
    /// operation: polling again cannot fix a rejected key or a bad request.
    async fn poll_once(&self, job_id: &str) -> Option<PollOutcome> {
        if let Some(metrics) = &self.metrics {
            metrics.poll_issued();
        }

        match self.poller.poll(job_id).await {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_transient() => {
                debug!(job_id, error = %e, "Transient poll failure, treating as pending");
                if let Some(metrics) = &self.metrics {
                    metrics.transient_poll_failure();
                }
                None
            }
            Err(e) => {
                warn!(job_id, error = %e, "Poll failed permanently");
                Some(PollOutcome::Failed(format!("poll failed: {}", e)))
            }
        }
    }

    fn expire(
        &self,
        pending: &mut Vec<AsyncOperation>,
        resolved: &mut BTreeMap<String, OperationResult>,
        counts: &mut SweepProgress,
    ) {
        let now = Instant::now();
        for op in pending.iter_mut() {
            let elapsed = now.saturating_duration_since(op.submitted_at);
            if elapsed >= self.config.timeout {
                warn!(job_id = %op.job_id, elapsed_secs = elapsed.as_secs(), "Operation timed out");
                op.resolve(OperationResult::TimedOut { elapsed });
            }
        }
        self.collect_terminal(pending, resolved, counts);
        counts.pending = pending.len();
    }

    fn collect_terminal(
        &self,
        pending: &mut Vec<AsyncOperation>,
        resolved: &mut BTreeMap<String, OperationResult>,
        counts: &mut SweepProgress,
    ) {
        let (done, still_pending): (Vec<_>, Vec<_>) = std::mem::take(pending)
            .into_iter()
            .partition(|op| op.state().is_terminal());
        *pending = still_pending;

        for (job_id, result) in done.into_iter().filter_map(AsyncOperation::into_result) {
            counts.record(&result);
            if let Some(metrics) = &self.metrics {
                match result.state() {
                    OperationState::Succeeded => metrics.operation_succeeded(),
                    OperationState::Failed => metrics.operation_failed(),
                    OperationState::TimedOut => metrics.operation_timed_out(),
                    OperationState::Pending => {}
                }
            }
            resolved.insert(job_id, result);
        }
    }
}

fn cancelled(
    resolved: BTreeMap<String, OperationResult>,
    pending: &[AsyncOperation],
) -> TrackerError {
    let pending: Vec<String> = pending.iter().map(|op| op.job_id.clone()).collect();
    info!(pending = pending.len(), "Operation tracking cancelled");
    TrackerError::Cancelled { resolved, pending }
}
