use super::plan::{NamePolicy, PlannedAction, ReconciliationPlan};
use super::{Fleet, FleetMember, LifecycleState};
use crate::client::ApiError;
use crate::observability::Metrics;
use crate::tracker::{
    AsyncOperation, JobPoller, OperationResult, OperationTracker, SweepProgress, TrackerError,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Accepted submission of a mutating call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub job_id: String,
    /// Resource id assigned up front, if any
    pub id: Option<String>,
}

/// The only way the reconciler touches the provider
#[async_trait]
pub trait FleetActions: Send + Sync {
    async fn create(&self, name: &str) -> Result<Submitted, ApiError>;

    async fn destroy(&self, member: &FleetMember) -> Result<Submitted, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    Create,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChangeOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
    /// The call was refused before a job existed
    NotSubmitted(String),
}

/// What happened to one requested change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeReport {
    pub name: String,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub outcome: ChangeOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub current: usize,
    pub target: usize,
    pub delta: i64,
    pub changes: Vec<ChangeReport>,
}

impl ReconcileReport {
    fn for_plan(plan: &ReconciliationPlan) -> Self {
        Self {
            current: plan.current,
            target: plan.target,
            delta: plan.delta,
            changes: Vec::new(),
        }
    }

    /// Every requested change succeeded
    pub fn is_complete(&self) -> bool {
        self.changes
            .iter()
            .all(|c| c.outcome == ChangeOutcome::Succeeded)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChangeReport> {
        self.changes
            .iter()
            .filter(|c| c.outcome != ChangeOutcome::Succeeded)
    }

    pub fn succeeded(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| c.outcome == ChangeOutcome::Succeeded)
            .count()
    }
}

/// Fleet after a cycle, reflecting only what is known to have happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub fleet: Fleet,
    pub report: ReconcileReport,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Members of unresolved jobs stay in `fleet` in their in-flight state
    #[error("reconciliation cancelled with {} operation(s) in flight", .pending.len())]
    Cancelled { fleet: Fleet, pending: Vec<String> },
}

/// Converges a fleet to a target size
#[derive(Debug, Clone)]
pub struct Reconciler {
    names: NamePolicy,
    metrics: Option<Arc<Metrics>>,
}

/// A submitted change waiting on its job
struct InFlight {
    name: String,
    kind: ChangeKind,
    previous: Option<LifecycleState>,
}

impl Reconciler {
    pub fn new(names: NamePolicy) -> Self {
        Self {
            names,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn names(&self) -> &NamePolicy {
        &self.names
    }

    pub fn plan(&self, fleet: &Fleet, target: usize) -> ReconciliationPlan {
        ReconciliationPlan::compute(fleet, target, &self.names)
    }

    /// Run one reconciliation cycle
    ///
    /// All calls are issued before polling starts. Partial failure is not an
    /// error: the report lists every change that did not complete.
    pub async fn reconcile<A, P>(
        &self,
        current: Fleet,
        target: usize,
        actions: &A,
        tracker: &OperationTracker<P>,
    ) -> Result<ReconcileOutcome, ReconcileError>
    where
        A: FleetActions + ?Sized,
        P: JobPoller,
    {
        let plan = self.plan(&current, target);
        let mut report = ReconcileReport::for_plan(&plan);
        let mut fleet = current;

        if plan.is_noop() {
            debug!(current = plan.current, target, "Fleet already at target size");
            return Ok(ReconcileOutcome { fleet, report });
        }

        info!(
            current = plan.current,
            target,
            delta = plan.delta,
            "Reconciling fleet"
        );

        let mut operations = Vec::with_capacity(plan.actions.len());
        let mut in_flight: HashMap<String, InFlight> = HashMap::new();

        for action in plan.actions {
            match action {
                PlannedAction::Create { name } => match actions.create(&name).await {
                    Ok(submitted) if in_flight.contains_key(&submitted.job_id) => {
                        warn!(member = %name, job_id = %submitted.job_id, "Create returned a job id already in flight");
                        report.changes.push(duplicate_job(name, ChangeKind::Create, submitted));
                    }
                    Ok(submitted) => {
                        debug!(member = %name, job_id = %submitted.job_id, "Create submitted");
                        let mut member = FleetMember::new(
                            submitted.id.unwrap_or_default(),
                            &name,
                            LifecycleState::Deploying,
                        );
                        member.job_id = Some(submitted.job_id.clone());
                        fleet.insert(member);
                        operations.push(AsyncOperation::new(&submitted.job_id));
                        in_flight.insert(
                            submitted.job_id,
                            InFlight {
                                name,
                                kind: ChangeKind::Create,
                                previous: None,
                            },
                        );
                    }
                    Err(e) => {
                        warn!(member = %name, error = %e, "Create was not submitted");
                        report.changes.push(ChangeReport {
                            name,
                            kind: ChangeKind::Create,
                            job_id: None,
                            outcome: ChangeOutcome::NotSubmitted(e.to_string()),
                        });
                    }
                },
                PlannedAction::Destroy { member } => match actions.destroy(&member).await {
                    Ok(submitted) if in_flight.contains_key(&submitted.job_id) => {
                        warn!(member = %member.name, job_id = %submitted.job_id, "Destroy returned a job id already in flight");
                        report.changes.push(duplicate_job(member.name, ChangeKind::Destroy, submitted));
                    }
                    Ok(submitted) => {
                        debug!(member = %member.name, job_id = %submitted.job_id, "Destroy submitted");
                        if let Some(tracked) = fleet.get_mut(&member.name) {
                            tracked.state = LifecycleState::Destroying;
                            tracked.job_id = Some(submitted.job_id.clone());
                        }
                        operations.push(AsyncOperation::new(&submitted.job_id));
                        in_flight.insert(
                            submitted.job_id,
                            InFlight {
                                name: member.name,
                                kind: ChangeKind::Destroy,
                                previous: Some(member.state),
                            },
                        );
                    }
                    Err(e) => {
                        warn!(member = %member.name, error = %e, "Destroy was not submitted");
                        report.changes.push(ChangeReport {
                            name: member.name,
                            kind: ChangeKind::Destroy,
                            job_id: None,
                            outcome: ChangeOutcome::NotSubmitted(e.to_string()),
                        });
                    }
                },
            }
        }

        let results = match tracker.await_all(operations, log_progress).await {
            Ok(results) => results,
            Err(TrackerError::Cancelled { resolved, pending }) => {
                self.apply(&mut fleet, &mut report, &mut in_flight, resolved);
                warn!(pending = pending.len(), "Reconciliation cancelled");
                return Err(ReconcileError::Cancelled { fleet, pending });
            }
        };

        self.apply(&mut fleet, &mut report, &mut in_flight, results);

        info!(
            members = fleet.counted(),
            target,
            succeeded = report.succeeded(),
            incomplete = report.failures().count(),
            "Reconciliation finished"
        );

        Ok(ReconcileOutcome { fleet, report })
    }

    fn apply(
        &self,
        fleet: &mut Fleet,
        report: &mut ReconcileReport,
        in_flight: &mut HashMap<String, InFlight>,
        results: BTreeMap<String, OperationResult>,
    ) {
        for (job_id, result) in results {
            let Some(change) = in_flight.remove(&job_id) else {
                continue;
            };

            let outcome = match (&change.kind, &result) {
                (ChangeKind::Create, OperationResult::Succeeded(payload)) => {
                    if let Some(member) = fleet.get_mut(&change.name) {
                        if let Some(id) = payload
                            .pointer("/virtualmachine/id")
                            .and_then(|v| v.as_str())
                        {
                            member.id = id.to_string();
                        }
                        member.state = LifecycleState::Running;
                        member.job_id = None;
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.member_created();
                    }
                    ChangeOutcome::Succeeded
                }
                (ChangeKind::Create, _) => {
                    fleet.remove(&change.name);
                    outcome_of(&result)
                }
                (ChangeKind::Destroy, OperationResult::Succeeded(_)) => {
                    fleet.remove(&change.name);
                    if let Some(metrics) = &self.metrics {
                        metrics.member_destroyed();
                    }
                    ChangeOutcome::Succeeded
                }
                (ChangeKind::Destroy, OperationResult::Failed(_)) => {
                    if let Some(member) = fleet.get_mut(&change.name) {
                        member.state = change.previous.unwrap_or(LifecycleState::Running);
                        member.job_id = None;
                    }
                    outcome_of(&result)
                }
                // Still Destroying with its job id; the next cycle does not count it
                (ChangeKind::Destroy, OperationResult::TimedOut { .. }) => outcome_of(&result),
            };

            report.changes.push(ChangeReport {
                name: change.name,
                kind: change.kind,
                job_id: Some(job_id),
                outcome,
            });
        }
    }
}

/// A submission whose job id another change already tracks; its fate is unknown
fn duplicate_job(name: String, kind: ChangeKind, submitted: Submitted) -> ChangeReport {
    ChangeReport {
        name,
        kind,
        job_id: None,
        outcome: ChangeOutcome::NotSubmitted(format!(
            "duplicate job id {}",
            submitted.job_id
        )),
    }
}

fn outcome_of(result: &OperationResult) -> ChangeOutcome {
    match result {
        OperationResult::Succeeded(_) => ChangeOutcome::Succeeded,
        OperationResult::Failed(reason) => ChangeOutcome::Failed(reason.clone()),
        OperationResult::TimedOut { .. } => ChangeOutcome::TimedOut,
    }
}

fn log_progress(progress: &SweepProgress) {
    info!(
        sweep = progress.sweep,
        pending = progress.pending,
        succeeded = progress.succeeded,
        failed = progress.failed,
        timed_out = progress.timed_out,
        "Waiting for fleet operations"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{PollOutcome, TrackerConfig};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Actions recording calls; names in `reject` are refused
    #[derive(Default)]
    struct RecordingActions {
        calls: Mutex<Vec<String>>,
        reject: Vec<String>,
        /// Job id handed to every submission instead of `job-<name>`
        shared_job: Option<String>,
    }

    impl RecordingActions {
        fn job_for(&self, name: &str) -> String {
            self.shared_job
                .clone()
                .unwrap_or_else(|| format!("job-{}", name))
        }
    }

    #[async_trait]
    impl FleetActions for RecordingActions {
        async fn create(&self, name: &str) -> Result<Submitted, ApiError> {
            self.calls.lock().unwrap().push(format!("create {}", name));
            if self.reject.iter().any(|r| r == name) {
                return Err(ApiError::Remote {
                    code: 431,
                    text: "no capacity".into(),
                });
            }
            Ok(Submitted {
                job_id: self.job_for(name),
                id: Some(format!("id-{}", name)),
            })
        }

        async fn destroy(&self, member: &FleetMember) -> Result<Submitted, ApiError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("destroy {}", member.name));
            Ok(Submitted {
                job_id: self.job_for(&member.name),
                id: None,
            })
        }
    }

    /// Poller resolving `job-<name>` from a fixed table; unknown jobs succeed
    struct TablePoller(HashMap<String, PollOutcome>);

    #[async_trait]
    impl JobPoller for TablePoller {
        async fn poll(&self, job_id: &str) -> Result<PollOutcome, ApiError> {
            Ok(self
                .0
                .get(job_id)
                .cloned()
                .unwrap_or_else(|| PollOutcome::Succeeded(json!({}))))
        }
    }

    fn tracker(table: &[(&str, PollOutcome)]) -> OperationTracker<TablePoller> {
        let table = table
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        OperationTracker::new(
            TablePoller(table),
            TrackerConfig {
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(5),
            },
        )
    }

    fn running(names: &[&str]) -> Fleet {
        names
            .iter()
            .map(|n| FleetMember::new(format!("id-{}", n), *n, LifecycleState::Running))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_destroy_restores_state() {
        let actions = RecordingActions::default();
        let tracker = tracker(&[("job-web-01", PollOutcome::Failed("locked".into()))]);
        let reconciler = Reconciler::new(NamePolicy::new("web"));

        let outcome = reconciler
            .reconcile(running(&["web-01", "web-02"]), 1, &actions, &tracker)
            .await
            .unwrap();

        let member = outcome.fleet.get("web-01").unwrap();
        assert_eq!(member.state, LifecycleState::Running);
        assert_eq!(member.job_id, None);
        assert_eq!(
            outcome.report.changes[0].outcome,
            ChangeOutcome::Failed("locked".into())
        );
        assert!(!outcome.report.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_destroy_stays_destroying() {
        let actions = RecordingActions::default();
        let tracker = tracker(&[("job-web-01", PollOutcome::Pending)]);
        let reconciler = Reconciler::new(NamePolicy::new("web"));

        let outcome = reconciler
            .reconcile(running(&["web-01", "web-02"]), 1, &actions, &tracker)
            .await
            .unwrap();

        let member = outcome.fleet.get("web-01").unwrap();
        assert_eq!(member.state, LifecycleState::Destroying);
        assert_eq!(member.job_id.as_deref(), Some("job-web-01"));
        assert_eq!(outcome.fleet.counted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_create_is_reported_not_tracked() {
        let actions = RecordingActions {
            reject: vec!["web-02".into()],
            ..Default::default()
        };
        let tracker = tracker(&[]);
        let reconciler = Reconciler::new(NamePolicy::new("web"));

        let outcome = reconciler
            .reconcile(Fleet::new(), 2, &actions, &tracker)
            .await
            .unwrap();

        assert_eq!(outcome.fleet.names(), vec!["web-01"]);
        let rejected = outcome.report.failures().next().unwrap();
        assert_eq!(rejected.name, "web-02");
        assert!(matches!(rejected.outcome, ChangeOutcome::NotSubmitted(_)));
        assert_eq!(rejected.job_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_job_id_is_reported_not_tracked() {
        let actions = RecordingActions {
            shared_job: Some("job-shared".into()),
            ..Default::default()
        };
        let tracker = tracker(&[]);
        let reconciler = Reconciler::new(NamePolicy::new("web"));

        let outcome = reconciler
            .reconcile(Fleet::new(), 2, &actions, &tracker)
            .await
            .unwrap();

        assert_eq!(outcome.fleet.names(), vec!["web-01"]);
        assert_eq!(outcome.report.changes.len(), 2);

        let duplicate = outcome.report.failures().next().unwrap();
        assert_eq!(duplicate.name, "web-02");
        assert_eq!(
            duplicate.outcome,
            ChangeOutcome::NotSubmitted("duplicate job id job-shared".into())
        );
        assert_eq!(outcome.report.succeeded(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_destroy_job_leaves_member_alone() {
        let actions = RecordingActions {
            shared_job: Some("job-shared".into()),
            ..Default::default()
        };
        let tracker = tracker(&[]);
        let reconciler = Reconciler::new(NamePolicy::new("web"));

        let outcome = reconciler
            .reconcile(running(&["web-01", "web-02", "web-03"]), 1, &actions, &tracker)
            .await
            .unwrap();

        assert_eq!(outcome.fleet.names(), vec!["web-02", "web-03"]);
        let kept = outcome.fleet.get("web-02").unwrap();
        assert_eq!(kept.state, LifecycleState::Running);
        assert_eq!(kept.job_id, None);
        assert!(matches!(
            outcome.report.failures().next().unwrap().outcome,
            ChangeOutcome::NotSubmitted(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_member_takes_id_from_job_result() {
        let actions = RecordingActions::default();
        let tracker = tracker(&[(
            "job-web-01",
            PollOutcome::Succeeded(json!({"virtualmachine": {"id": "vm-42"}})),
        )]);
        let reconciler = Reconciler::new(NamePolicy::new("web"));

        let outcome = reconciler
            .reconcile(Fleet::new(), 1, &actions, &tracker)
            .await
            .unwrap();

        let member = outcome.fleet.get("web-01").unwrap();
        assert_eq!(member.id, "vm-42");
        assert_eq!(member.state, LifecycleState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_reconcile_keeps_in_flight_members() {
        let actions = RecordingActions::default();
        let tracker = tracker(&[("job-web-01", PollOutcome::Pending)]);
        tracker.cancellation_token().cancel();
        let reconciler = Reconciler::new(NamePolicy::new("web"));

        let err = reconciler
            .reconcile(Fleet::new(), 1, &actions, &tracker)
            .await
            .unwrap_err();

        let ReconcileError::Cancelled { fleet, pending } = err;
        assert_eq!(pending, vec!["job-web-01".to_string()]);
        assert_eq!(
            fleet.get("web-01").unwrap().state,
            LifecycleState::Deploying
        );
    }
}
