//! Observability: tracing setup and fleet counters

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, reload};

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("failed to swap log filter: {0}")]
    Reload(String),
}

/// Handle to the installed subscriber's filter
pub struct TracingHandle {
    filter: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TracingHandle {
    /// Replace the startup filter with `directive`
    ///
    /// `RUST_LOG` wins when set; the directive is still checked.
    pub fn apply_filter(&self, directive: &str) -> Result<(), TracingError> {
        let filter = EnvFilter::try_new(directive).map_err(|e| TracingError::InvalidFilter {
            directive: directive.to_string(),
            reason: e.to_string(),
        })?;

        if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
            return Ok(());
        }

        match &self.filter {
            Some(handle) => handle
                .reload(filter)
                .map_err(|e| TracingError::Reload(e.to_string())),
            None => Ok(()),
        }
    }
}

/// Install the global fmt subscriber
///
/// Called before configuration is loaded so config warnings are not lost;
/// the configured filter is applied afterwards through the returned handle.
pub fn init_tracing(default_filter: &str) -> TracingHandle {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    // A subscriber may already be installed (tests, embedding)
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok();

    TracingHandle {
        filter: installed.then_some(handle),
    }
}

/// Metrics handle for recording counters
#[derive(Debug, Default)]
pub struct Metrics {
    polls_issued: AtomicU64,
    transient_poll_failures: AtomicU64,
    operations_succeeded: AtomicU64,
    operations_failed: AtomicU64,
    operations_timed_out: AtomicU64,
    members_created: AtomicU64,
    members_destroyed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_issued(&self) {
        self.polls_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transient_poll_failure(&self) {
        self.transient_poll_failures.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "transient_poll_failures", "Metric incremented");
    }

    pub fn operation_succeeded(&self) {
        self.operations_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "operations_succeeded", "Metric incremented");
    }

    pub fn operation_failed(&self) {
        self.operations_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "operations_failed", "Metric incremented");
    }

    pub fn operation_timed_out(&self) {
        self.operations_timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "operations_timed_out", "Metric incremented");
    }

    pub fn member_created(&self) {
        self.members_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "members_created", "Metric incremented");
    }

    pub fn member_destroyed(&self) {
        self.members_destroyed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "members_destroyed", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            polls_issued: self.polls_issued.load(Ordering::Relaxed),
            transient_poll_failures: self.transient_poll_failures.load(Ordering::Relaxed),
            operations_succeeded: self.operations_succeeded.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            operations_timed_out: self.operations_timed_out.load(Ordering::Relaxed),
            members_created: self.members_created.load(Ordering::Relaxed),
            members_destroyed: self.members_destroyed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub polls_issued: u64,
    pub transient_poll_failures: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub operations_timed_out: u64,
    pub members_created: u64,
    pub members_destroyed: u64,
}
