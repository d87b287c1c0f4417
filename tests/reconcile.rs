use std::sync::Arc;
use std::time::Duration;
use vdcfleet::autoscale::{Autoscaler, ScalingPolicy, StaticLoad};
use vdcfleet::client::{
    CloudApi, CloudCall, CloudPoller, DeployTemplate, InMemoryCloud, JobBehavior, VmFilter,
};
use vdcfleet::fleet::{
    ChangeKind, ChangeOutcome, CloudFleetActions, Fleet, LifecycleState, NamePolicy, Reconciler,
};
use vdcfleet::observability::Metrics;
use vdcfleet::tracker::{OperationTracker, TrackerConfig};

fn template() -> DeployTemplate {
    DeployTemplate {
        zone_id: "z1".into(),
        template_id: "debian-12".into(),
        service_offering_id: "small".into(),
        network_ids: vec!["priv".into()],
        keypair: Some("ops".into()),
    }
}

fn tracker_config() -> TrackerConfig {
    TrackerConfig {
        interval: Duration::from_secs(2),
        timeout: Duration::from_secs(30),
    }
}

/// Cloud, actions and tracker wired the way the binary wires them
struct Harness {
    cloud: Arc<InMemoryCloud>,
    actions: CloudFleetActions<InMemoryCloud>,
    tracker: OperationTracker<CloudPoller<InMemoryCloud>>,
    reconciler: Reconciler,
}

impl Harness {
    fn new() -> Self {
        let cloud = Arc::new(InMemoryCloud::new());
        Self {
            actions: CloudFleetActions::new(Arc::clone(&cloud), template()),
            tracker: OperationTracker::new(CloudPoller::new(Arc::clone(&cloud)), tracker_config()),
            reconciler: Reconciler::new(NamePolicy::new("web")),
            cloud,
        }
    }

    async fn fleet(&self) -> Fleet {
        let vms = self
            .cloud
            .list_virtual_machines(&VmFilter::all())
            .await
            .unwrap();
        Fleet::from_listing(&vms, "web")
    }

    async fn mutating_calls(&self) -> Vec<CloudCall> {
        self.cloud
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, CloudCall::Deploy { .. } | CloudCall::Destroy { .. }))
            .collect()
    }
}

#[tokio::test(start_paused = true)]
async fn test_fleet_at_target_is_left_alone() {
    let h = Harness::new();
    for name in ["web-01", "web-02", "web-03"] {
        h.cloud.seed_vm(name, "Running").await;
    }
    let fleet = h.fleet().await;

    let outcome = h
        .reconciler
        .reconcile(fleet.clone(), 3, &h.actions, &h.tracker)
        .await
        .unwrap();

    assert_eq!(outcome.fleet, fleet);
    assert!(outcome.report.changes.is_empty());
    assert_eq!(outcome.report.delta, 0);
    assert!(h.mutating_calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scale_up_creates_missing_members() {
    let h = Harness::new();
    h.cloud.seed_vm("web-01", "Running").await;
    h.cloud.seed_vm("web-02", "Running").await;
    h.cloud
        .script_deploys([
            JobBehavior::SucceedAfter(1),
            JobBehavior::SucceedAfter(3),
            JobBehavior::SucceedAfter(2),
        ])
        .await;

    let outcome = h
        .reconciler
        .reconcile(h.fleet().await, 5, &h.actions, &h.tracker)
        .await
        .unwrap();

    assert_eq!(
        h.mutating_calls().await,
        vec![
            CloudCall::Deploy {
                name: "web-03".into()
            },
            CloudCall::Deploy {
                name: "web-04".into()
            },
            CloudCall::Deploy {
                name: "web-05".into()
            },
        ]
    );
    assert_eq!(outcome.fleet.len(), 5);
    assert_eq!(outcome.fleet.counted(), 5);
    for name in ["web-03", "web-04", "web-05"] {
        let member = outcome.fleet.get(name).unwrap();
        assert_eq!(member.state, LifecycleState::Running);
        assert!(!member.id.is_empty());
        assert_eq!(member.job_id, None);
    }
    assert!(outcome.report.is_complete());
    assert_eq!(outcome.report.succeeded(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_every_call_is_issued_before_polling() {
    let h = Harness::new();

    h.reconciler
        .reconcile(Fleet::new(), 3, &h.actions, &h.tracker)
        .await
        .unwrap();

    let calls = h.cloud.calls().await;
    let first_poll = calls
        .iter()
        .position(|c| matches!(c, CloudCall::Poll { .. }))
        .unwrap();
    let last_deploy = calls
        .iter()
        .rposition(|c| matches!(c, CloudCall::Deploy { .. }))
        .unwrap();
    assert!(last_deploy < first_poll);
}

#[tokio::test(start_paused = true)]
async fn test_scale_down_picks_victims_by_name() {
    let h = Harness::new();
    // Seeded out of order on purpose
    let id_b = h.cloud.seed_vm("web-b", "Running").await;
    let id_a = h.cloud.seed_vm("web-a", "Running").await;
    h.cloud.seed_vm("web-c", "Running").await;

    let outcome = h
        .reconciler
        .reconcile(h.fleet().await, 1, &h.actions, &h.tracker)
        .await
        .unwrap();

    assert_eq!(
        h.mutating_calls().await,
        vec![CloudCall::Destroy { id: id_a }, CloudCall::Destroy { id: id_b }]
    );
    assert_eq!(outcome.fleet.names(), vec!["web-c"]);
    let destroyed: Vec<_> = outcome
        .report
        .changes
        .iter()
        .filter(|c| c.kind == ChangeKind::Destroy && c.outcome == ChangeOutcome::Succeeded)
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(destroyed.len(), 2);
    assert_eq!(h.cloud.vms().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_scale_up_reports_timeout() {
    let h = Harness::new();
    h.cloud.seed_vm("web-01", "Running").await;
    h.cloud
        .script_deploys([
            JobBehavior::SucceedAfter(1),
            JobBehavior::SucceedAfter(2),
            JobBehavior::Never,
        ])
        .await;

    let outcome = h
        .reconciler
        .reconcile(h.fleet().await, 4, &h.actions, &h.tracker)
        .await
        .unwrap();

    assert_eq!(outcome.fleet.counted(), 3);
    assert_eq!(outcome.fleet.names(), vec!["web-01", "web-02", "web-03"]);

    let incomplete: Vec<_> = outcome.report.failures().collect();
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].name, "web-04");
    assert_eq!(incomplete[0].outcome, ChangeOutcome::TimedOut);
    assert!(incomplete[0].job_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failed_create_is_not_promoted() {
    let h = Harness::new();
    h.cloud
        .script_deploys([
            JobBehavior::SucceedAfter(1),
            JobBehavior::FailAfter(2, "Insufficient capacity".into()),
        ])
        .await;

    let outcome = h
        .reconciler
        .reconcile(Fleet::new(), 2, &h.actions, &h.tracker)
        .await
        .unwrap();

    assert_eq!(outcome.fleet.names(), vec!["web-01"]);
    let failed = outcome.report.failures().next().unwrap();
    assert_eq!(failed.name, "web-02");
    assert_eq!(
        failed.outcome,
        ChangeOutcome::Failed("Insufficient capacity".into())
    );
}

#[tokio::test(start_paused = true)]
async fn test_lookup_lag_counts_as_pending() {
    let h = Harness::new();
    h.cloud.set_lookup_lag(2).await;
    let metrics = Arc::new(Metrics::new());
    let tracker = OperationTracker::new(CloudPoller::new(Arc::clone(&h.cloud)), tracker_config())
        .with_metrics(Arc::clone(&metrics));

    let outcome = h
        .reconciler
        .reconcile(Fleet::new(), 2, &h.actions, &tracker)
        .await
        .unwrap();

    assert!(outcome.report.is_complete());
    assert_eq!(outcome.fleet.counted(), 2);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.transient_poll_failures, 4);
    assert_eq!(snapshot.operations_succeeded, 2);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_deploys_count_toward_size() {
    let h = Harness::new();
    h.cloud.seed_vm("web-01", "Running").await;
    h.cloud.seed_vm("web-02", "Starting").await;
    h.cloud.seed_vm("web-03", "Stopped").await;

    let outcome = h
        .reconciler
        .reconcile(h.fleet().await, 2, &h.actions, &h.tracker)
        .await
        .unwrap();

    assert_eq!(outcome.report.current, 2);
    assert!(h.mutating_calls().await.is_empty());
    assert_eq!(outcome.fleet.len(), 3);
}

#[test]
fn test_target_rounds_load_up() {
    let policy = ScalingPolicy::new(5, 1, 10).unwrap();
    assert_eq!(policy.target_for_load(22), 5);
}

#[tokio::test(start_paused = true)]
async fn test_autoscaler_follows_load() {
    let cloud = Arc::new(InMemoryCloud::new());
    let load = StaticLoad::new(22);
    let autoscaler = Autoscaler::new(
        Arc::clone(&cloud),
        load,
        ScalingPolicy::new(5, 1, 10).unwrap(),
        Reconciler::new(NamePolicy::new("web")),
        CloudFleetActions::new(Arc::clone(&cloud), template()),
        OperationTracker::new(CloudPoller::new(Arc::clone(&cloud)), tracker_config()),
    );

    let report = autoscaler.run_once().await.unwrap();
    assert_eq!(report.load, 22);
    assert_eq!(report.target, 5);
    assert_eq!(report.outcome.fleet.counted(), 5);
    assert_eq!(cloud.vms().await.len(), 5);

    let outcome = autoscaler.reconcile_to(2).await.unwrap();
    assert_eq!(outcome.fleet.names(), vec!["web-04", "web-05"]);
    assert!(outcome.report.is_complete());

    let names: Vec<_> = cloud.vms().await.into_iter().map(|vm| vm.name).collect();
    assert_eq!(names, vec!["web-04", "web-05"]);
}
