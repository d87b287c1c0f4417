//! Load-based autoscaling
//!
//! Each cycle reads the load signal, derives a target size, lists the fleet
//! and reconciles it.

pub mod load;

pub use load::{HaproxyStats, LoadSource, StaticLoad, parse_haproxy_csv};

use crate::client::{ApiError, CloudApi, CloudPoller, VmFilter};
use crate::fleet::{CloudFleetActions, Fleet, ReconcileError, ReconcileOutcome, Reconciler};
use crate::tracker::OperationTracker;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("invalid scaling policy: {0}")]
    InvalidPolicy(String),

    #[error("load signal unavailable: {0}")]
    Load(String),

    #[error("fleet listing failed: {0}")]
    Api(#[from] ApiError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

pub type Result<T> = std::result::Result<T, AutoscaleError>;

/// Maps a load signal onto a fleet size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    capacity_per_instance: NonZeroU64,
    min_instances: usize,
    max_instances: usize,
}

impl ScalingPolicy {
    pub fn new(capacity_per_instance: u64, min_instances: usize, max_instances: usize) -> Result<Self> {
        let capacity_per_instance = NonZeroU64::new(capacity_per_instance).ok_or_else(|| {
            AutoscaleError::InvalidPolicy("capacity per instance must be positive".to_string())
        })?;
        if min_instances > max_instances {
            return Err(AutoscaleError::InvalidPolicy(format!(
                "min_instances ({}) exceeds max_instances ({})",
                min_instances, max_instances
            )));
        }

        Ok(Self {
            capacity_per_instance,
            min_instances,
            max_instances,
        })
    }

    pub fn capacity_per_instance(&self) -> u64 {
        self.capacity_per_instance.get()
    }

    pub fn min_instances(&self) -> usize {
        self.min_instances
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    /// ceil(load / capacity), clamped to [min, max]
    pub fn target_for_load(&self, load: u64) -> usize {
        let needed = load.div_ceil(self.capacity_per_instance.get());
        let needed = usize::try_from(needed).unwrap_or(usize::MAX);
        needed.clamp(self.min_instances, self.max_instances)
    }
}

/// Result of one autoscaling cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub load: u64,
    pub target: usize,
    pub outcome: ReconcileOutcome,
}

pub struct Autoscaler<C: ?Sized, L> {
    cloud: Arc<C>,
    load: L,
    policy: ScalingPolicy,
    reconciler: Reconciler,
    actions: CloudFleetActions<C>,
    tracker: OperationTracker<CloudPoller<C>>,
    zone_id: Option<String>,
    period: Duration,
    cancel: CancellationToken,
}

impl<C, L> Autoscaler<C, L>
where
    C: CloudApi + ?Sized,
    L: LoadSource,
{
    pub fn new(
        cloud: Arc<C>,
        load: L,
        policy: ScalingPolicy,
        reconciler: Reconciler,
        actions: CloudFleetActions<C>,
        tracker: OperationTracker<CloudPoller<C>>,
    ) -> Self {
        let cancel = tracker.cancellation_token().clone();
        let zone_id = Some(actions.template().zone_id.clone()).filter(|z| !z.is_empty());

        Self {
            cloud,
            load,
            policy,
            reconciler,
            actions,
            tracker,
            zone_id,
            period: Duration::from_secs(60),
            cancel,
        }
    }

    /// Pause between cycles in `run`
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Token that stops `run` and aborts an in-progress reconciliation
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// List the fleet as the provider currently reports it
    pub async fn current_fleet(&self) -> Result<Fleet> {
        let mut filter = VmFilter::all();
        filter.zone_id = self.zone_id.clone();
        let vms = self.cloud.list_virtual_machines(&filter).await?;
        Ok(Fleet::from_listing(&vms, self.reconciler.names().prefix()))
    }

    /// List the fleet and reconcile it to `target`
    pub async fn reconcile_to(&self, target: usize) -> Result<ReconcileOutcome> {
        let fleet = self.current_fleet().await?;
        let outcome = self
            .reconciler
            .reconcile(fleet, target, &self.actions, &self.tracker)
            .await?;
        Ok(outcome)
    }

    pub async fn run_once(&self) -> Result<CycleReport> {
        let load = self.load.current_load().await?;
        let target = self.policy.target_for_load(load);
        info!(load, target, "Autoscaling cycle");

        let outcome = self.reconcile_to(target).await?;

        for change in outcome.report.failures() {
            warn!(
                member = %change.name,
                kind = ?change.kind,
                outcome = ?change.outcome,
                "Fleet change did not complete"
            );
        }

        Ok(CycleReport {
            load,
            target,
            outcome,
        })
    }

    /// Run cycles every `period` until cancelled
    ///
    /// A failed cycle is logged and retried on the next period.
    pub async fn run(&self) {
        info!(period_secs = self.period.as_secs(), "Autoscaler started");

        loop {
            match self.run_once().await {
                Ok(report) => info!(
                    load = report.load,
                    target = report.target,
                    members = report.outcome.fleet.counted(),
                    complete = report.outcome.report.is_complete(),
                    "Autoscaling cycle finished"
                ),
                Err(AutoscaleError::Reconcile(ReconcileError::Cancelled { pending, .. })) => {
                    warn!(pending = pending.len(), "Autoscaling cycle cancelled");
                    break;
                }
                Err(e) => error!(error = %e, "Autoscaling cycle failed"),
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
        }

        info!("Autoscaler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_rounds_up() {
        let policy = ScalingPolicy::new(5, 1, 10).unwrap();
        assert_eq!(policy.target_for_load(22), 5);
        assert_eq!(policy.target_for_load(20), 4);
        assert_eq!(policy.target_for_load(21), 5);
    }

    #[test]
    fn test_target_is_clamped() {
        let policy = ScalingPolicy::new(10, 2, 6).unwrap();
        assert_eq!(policy.target_for_load(0), 2);
        assert_eq!(policy.target_for_load(1_000), 6);
        assert_eq!(policy.target_for_load(u64::MAX), 6);
    }

    #[test]
    fn test_invalid_policies() {
        assert!(matches!(
            ScalingPolicy::new(0, 1, 2),
            Err(AutoscaleError::InvalidPolicy(_))
        ));
        assert!(matches!(
            ScalingPolicy::new(5, 3, 2),
            Err(AutoscaleError::InvalidPolicy(_))
        ));
    }
}
