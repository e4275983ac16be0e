//! RayCluster scenarios.

use jiff::{SignedDuration, Timestamp};
use kube::ResourceExt;

use ray_operator::config::EngineConfig;
use ray_operator::controller::error::ErrorKind;
use ray_operator::crd::{ClusterPhase, RayCluster};
use ray_operator::gateway::CLUSTER_FINALIZER;
use ray_operator::gateway::memory::{FaultKind, GatewayCall, GatewayOp};
use ray_operator::resources::UnitKey;
use ray_operator::scheduler::ReconcileOutcome;

use crate::{Harness, NS, cluster_spec, worker_group};

fn condition_true(status: &ray_operator::crd::RayClusterStatus, kind: &str) -> bool {
    status.conditions.iter().any(|c| c.r#type == kind && c.is_true())
}

#[tokio::test]
async fn test_end_to_end_head_and_bounded_group() {
    let h = Harness::new();
    h.gateway()
        .insert_cluster(RayCluster::new("demo", cluster_spec(vec![worker_group("small", 2, 1, 3)])));

    let status = h.settle_cluster("demo").await;

    assert_eq!(status.phase, ClusterPhase::Running);
    assert_eq!(status.desired_worker_replicas, 2);
    assert_eq!(status.ready_worker_replicas, 2);
    assert_eq!(status.min_worker_replicas, 1);
    assert_eq!(status.max_worker_replicas, 3);
    assert_eq!(status.worker_groups[0].ready_replicas, 2);
    let head = status.head.clone().unwrap();
    assert_eq!(head.pod_name.as_deref(), Some("demo-head"));
    assert!(head.pod_ip.is_some());
    assert_eq!(head.service_name.as_deref(), Some("demo-head-svc"));
    assert_eq!(status.endpoints.get("dashboard").map(String::as_str), Some("8265"));
    assert!(condition_true(&status, "Ready"));
    assert!(condition_true(&status, "SpecValid"));

    let mut workers = h.gateway().pod_names(NS, "ray.io/node-type", "worker");
    workers.sort();
    assert_eq!(workers, vec!["demo-small-worker-0", "demo-small-worker-1"]);

    let cluster = h.gateway().cluster(NS, "demo").unwrap();
    assert!(cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER));
}

#[tokio::test]
async fn test_converges_without_duplicates_when_lists_lag() {
    let h = Harness::new();
    h.gateway()
        .insert_cluster(RayCluster::new("demo", cluster_spec(vec![worker_group("small", 2, 0, 4)])));
    h.gateway().set_hide_new_units(true);

    h.reconcile_cluster("demo").await;
    assert_eq!(h.gateway().units(NS).len(), 4);

    // The second pass does not see the fresh units and plans them again.
    h.gateway().set_hide_new_units(false);
    h.reconcile_cluster("demo").await;
    assert_eq!(h.gateway().units(NS).len(), 4);
    assert_eq!(h.gateway().unit_mutations().len(), 4);

    h.gateway().mark_all_pods_ready(NS);
    assert_eq!(h.reconcile_cluster("demo").await, ReconcileOutcome::Done);
    assert_eq!(h.cluster_status("demo").phase, ClusterPhase::Running);
}

#[tokio::test]
async fn test_converged_cluster_is_left_alone() {
    let h = Harness::new();
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 2, 0, 4)]))
        .await;

    for _ in 0..3 {
        assert_eq!(h.reconcile_cluster("demo").await, ReconcileOutcome::Done);
    }
    assert!(h.gateway().unit_mutations().is_empty());
}

#[tokio::test]
async fn test_scale_up_creates_only_new_workers() {
    let h = Harness::new();
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 3, 1, 5)]))
        .await;

    h.gateway().update_cluster(NS, "demo", |c| {
        c.spec.worker_group_specs[0].replicas = 5;
    });
    h.reconcile_cluster("demo").await;

    assert_eq!(
        h.gateway().unit_mutations(),
        vec![
            GatewayCall::CreateUnit(UnitKey::pod("demo-small-worker-3")),
            GatewayCall::CreateUnit(UnitKey::pod("demo-small-worker-4")),
        ]
    );

    let status = h.settle_cluster("demo").await;
    assert_eq!(status.ready_worker_replicas, 5);
}

#[tokio::test]
async fn test_scale_down_removes_named_worker() {
    let h = Harness::new();
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 3, 1, 5)]))
        .await;

    h.gateway().update_cluster(NS, "demo", |c| {
        let group = &mut c.spec.worker_group_specs[0];
        group.replicas = 2;
        group.scale_strategy.workers_to_delete = vec!["demo-small-worker-1".into()];
    });
    h.reconcile_cluster("demo").await;

    assert_eq!(
        h.gateway().unit_mutations(),
        vec![GatewayCall::DeleteUnit(UnitKey::pod("demo-small-worker-1"))]
    );
    let mut workers = h.gateway().pod_names(NS, "ray.io/node-type", "worker");
    workers.sort();
    assert_eq!(workers, vec!["demo-small-worker-0", "demo-small-worker-2"]);

    let status = h.settle_cluster("demo").await;
    assert_eq!(status.ready_worker_replicas, 2);
}

#[tokio::test]
async fn test_disruption_guard_holds_head_recreate() {
    let h = Harness::new();
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 2, 0, 4)]))
        .await;

    h.gateway().update_cluster(NS, "demo", |c| {
        c.spec.head_group_spec.template.image = "rayproject/ray:2.10.0".into();
    });
    h.reconcile_cluster("demo").await;

    assert!(h.gateway().unit_mutations().is_empty());
    let status = h.cluster_status("demo");
    assert_eq!(status.phase, ClusterPhase::Running);
    assert!(condition_true(&status, "UpgradeBlocked"));
    assert!(h.warnings("demo").contains(&"DisruptiveChangeBlocked".to_string()));

    // The warning is published once, not on every pass.
    h.reconcile_cluster("demo").await;
    let blocked = h
        .warnings("demo")
        .into_iter()
        .filter(|r| r == "DisruptiveChangeBlocked")
        .count();
    assert_eq!(blocked, 1);
}

#[tokio::test]
async fn test_forced_upgrade_recreates_head_and_workers() {
    let h = Harness::with_config(EngineConfig {
        forced_upgrade: true,
        ..Default::default()
    });
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 1, 0, 4)]))
        .await;

    h.gateway().update_cluster(NS, "demo", |c| {
        c.spec.head_group_spec.template.image = "rayproject/ray:2.10.0".into();
    });
    h.reconcile_cluster("demo").await;

    // Workers carry the head identity, so they are replaced with it.
    assert_eq!(
        h.gateway().unit_mutations(),
        vec![
            GatewayCall::DeleteUnit(UnitKey::pod("demo-head")),
            GatewayCall::DeleteUnit(UnitKey::pod("demo-small-worker-0")),
        ]
    );
    assert_eq!(h.cluster_status("demo").phase, ClusterPhase::Upgrading);

    let status = h.settle_cluster("demo").await;
    assert_eq!(status.phase, ClusterPhase::Running);
    assert!(h.gateway().unit(NS, &UnitKey::pod("demo-head")).is_some());
}

#[tokio::test]
async fn test_rolling_worker_upgrade_releases_one_per_pass() {
    let h = Harness::with_config(EngineConfig {
        worker_upgrade_batch_size: 1,
        ..Default::default()
    });
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 2, 0, 4)]))
        .await;

    h.gateway().update_cluster(NS, "demo", |c| {
        c.spec.worker_group_specs[0].template.image = "rayproject/ray:2.10.0".into();
    });
    h.reconcile_cluster("demo").await;

    assert_eq!(
        h.gateway().unit_mutations(),
        vec![GatewayCall::DeleteUnit(UnitKey::pod("demo-small-worker-0"))]
    );
    let status = h.cluster_status("demo");
    assert_eq!(status.phase, ClusterPhase::Upgrading);
    assert!(condition_true(&status, "UpgradeBlocked"));

    let status = h.settle_cluster("demo").await;
    assert_eq!(status.phase, ClusterPhase::Running);
    assert!(!condition_true(&status, "UpgradeBlocked"));
}

#[tokio::test]
async fn test_degraded_and_recovery() {
    let h = Harness::new();
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 2, 0, 4)]))
        .await;

    let since = Timestamp::now()
        .checked_sub(SignedDuration::from_secs(120))
        .unwrap();
    h.gateway()
        .set_pod_ready(NS, "demo-small-worker-1", false, Some(since));
    h.reconcile_cluster("demo").await;

    let status = h.cluster_status("demo");
    assert_eq!(status.phase, ClusterPhase::Degraded);
    assert!(condition_true(&status, "Degraded"));
    assert!(h.warnings("demo").contains(&"Degraded".to_string()));
    assert!(h.gateway().unit_mutations().is_empty());

    h.gateway().mark_all_pods_ready(NS);
    assert_eq!(h.reconcile_cluster("demo").await, ReconcileOutcome::Done);
    let status = h.cluster_status("demo");
    assert_eq!(status.phase, ClusterPhase::Running);
    assert!(!condition_true(&status, "Degraded"));
}

#[tokio::test]
async fn test_failed_worker_is_replaced() {
    let h = Harness::new();
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 2, 0, 4)]))
        .await;

    h.gateway().set_pod_phase(NS, "demo-small-worker-0", "Failed");
    h.reconcile_cluster("demo").await;
    assert_eq!(
        h.gateway().unit_mutations(),
        vec![GatewayCall::DeleteUnit(UnitKey::pod("demo-small-worker-0"))]
    );
    let status = h.cluster_status("demo");
    assert_eq!(status.unit_restarts, 1);
    // The worker failed moments ago, well inside the grace period.
    assert_eq!(status.phase, ClusterPhase::Pending);
    assert!(!condition_true(&status, "Degraded"));

    let status = h.settle_cluster("demo").await;
    assert_eq!(status.phase, ClusterPhase::Running);
    assert!(h.gateway().unit(NS, &UnitKey::pod("demo-small-worker-0")).is_some());
}

#[tokio::test]
async fn test_failure_budget_marks_failed_until_spec_changes() {
    let h = Harness::with_config(EngineConfig {
        failure_budget: 2,
        ..Default::default()
    });
    h.gateway()
        .insert_cluster(RayCluster::new("demo", cluster_spec(vec![worker_group("small", 1, 0, 4)])));
    h.gateway()
        .fail(GatewayOp::CreateUnit, None, 100, FaultKind::Rejected);

    assert_eq!(
        h.reconcile_cluster("demo").await,
        ReconcileOutcome::Error(ErrorKind::PartialPlan)
    );
    assert_eq!(h.cluster_status("demo").consecutive_failures, 1);

    assert_eq!(h.reconcile_cluster("demo").await, ReconcileOutcome::Done);
    let status = h.cluster_status("demo");
    assert_eq!(status.phase, ClusterPhase::Failed);
    assert!(status.last_error.is_some());
    assert!(h.warnings("demo").contains(&"ConvergenceFailed".to_string()));

    // Failed is sticky while the spec is unchanged.
    h.gateway().clear_faults();
    h.gateway().clear_calls();
    assert_eq!(h.reconcile_cluster("demo").await, ReconcileOutcome::Done);
    assert!(h.gateway().unit_mutations().is_empty());

    h.gateway().update_cluster(NS, "demo", |c| {
        c.spec.worker_group_specs[0].replicas = 2;
    });
    h.reconcile_cluster("demo").await;
    let status = h.cluster_status("demo");
    assert_eq!(status.phase, ClusterPhase::Pending);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(h.gateway().units(NS).len(), 4);
}

#[tokio::test]
async fn test_api_outage_does_not_spend_failure_budget() {
    let h = Harness::new();
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 2, 0, 4)]))
        .await;

    h.gateway().update_cluster(NS, "demo", |c| {
        c.spec.worker_group_specs[0].replicas = 3;
    });
    h.gateway()
        .fail(GatewayOp::CreateUnit, Some("demo-small-worker-2"), 5, FaultKind::Transient);
    for _ in 0..5 {
        assert_eq!(
            h.reconcile_cluster("demo").await,
            ReconcileOutcome::Error(ErrorKind::PartialPlan)
        );
    }
    let status = h.cluster_status("demo");
    assert_ne!(status.phase, ClusterPhase::Failed);
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.last_error.unwrap().contains("demo-small-worker-2"));

    let status = h.settle_cluster("demo").await;
    assert_eq!(status.phase, ClusterPhase::Running);
    assert_eq!(status.ready_worker_replicas, 3);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_invalid_spec_is_reported_once_per_generation() {
    let h = Harness::new();
    h.gateway()
        .insert_cluster(RayCluster::new("demo", cluster_spec(vec![worker_group("small", 5, 0, 3)])));

    for _ in 0..3 {
        assert_eq!(
            h.reconcile_cluster("demo").await,
            ReconcileOutcome::Error(ErrorKind::Configuration)
        );
    }
    assert!(h.gateway().units(NS).is_empty());
    assert_eq!(h.warnings("demo"), vec!["InvalidSpec".to_string()]);
    let status = h.cluster_status("demo");
    assert!(!condition_true(&status, "SpecValid"));

    h.gateway().update_cluster(NS, "demo", |c| {
        c.spec.worker_group_specs[0].replicas = 3;
    });
    let status = h.settle_cluster("demo").await;
    assert_eq!(status.phase, ClusterPhase::Running);
    assert!(condition_true(&status, "SpecValid"));
}

#[tokio::test]
async fn test_deletion_cascades_only_to_own_units() {
    let h = Harness::new();
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 2, 0, 4)]))
        .await;
    h.running_cluster("other", cluster_spec(vec![worker_group("small", 1, 0, 4)]))
        .await;
    assert_eq!(h.gateway().units(NS).len(), 7);

    h.gateway().remove_cluster(NS, "demo");
    let cluster = h.gateway().cluster(NS, "demo").unwrap();
    assert!(cluster.metadata.deletion_timestamp.is_some());

    assert_eq!(h.reconcile_cluster("demo").await, ReconcileOutcome::Done);
    assert!(h.gateway().cluster(NS, "demo").is_none());
    assert_eq!(h.gateway().unit_mutations().len(), 4);

    let mut remaining: Vec<String> = h.gateway().units(NS).iter().map(|u| u.name().to_string()).collect();
    remaining.sort();
    assert_eq!(remaining, vec!["other-head", "other-head-svc", "other-small-worker-0"]);
    assert_eq!(h.reconcile_cluster("other").await, ReconcileOutcome::Done);
    assert_eq!(h.gateway().unit_mutations().len(), 4);
}

#[tokio::test]
async fn test_deletion_retries_when_a_unit_delete_fails() {
    let h = Harness::new();
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 1, 0, 4)]))
        .await;

    h.gateway().remove_cluster(NS, "demo");
    h.gateway()
        .fail(GatewayOp::DeleteUnit, Some("demo-head"), 1, FaultKind::Transient);
    assert_eq!(
        h.reconcile_cluster("demo").await,
        ReconcileOutcome::Error(ErrorKind::Transient)
    );
    assert!(h.gateway().cluster(NS, "demo").is_some());

    assert_eq!(h.reconcile_cluster("demo").await, ReconcileOutcome::Done);
    assert!(h.gateway().cluster(NS, "demo").is_none());
}

#[tokio::test]
async fn test_replacement_waits_for_terminating_unit() {
    let h = Harness::new();
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 2, 0, 4)]))
        .await;
    h.gateway().set_graceful_deletion(true);

    h.gateway().set_pod_phase(NS, "demo-small-worker-1", "Failed");
    h.reconcile_cluster("demo").await;
    assert_eq!(
        h.gateway().unit_mutations(),
        vec![GatewayCall::DeleteUnit(UnitKey::pod("demo-small-worker-1"))]
    );

    // The old Pod is still terminating, so its name is not reused yet.
    h.gateway().clear_calls();
    assert!(matches!(
        h.reconcile_cluster("demo").await,
        ReconcileOutcome::RetryAfter(_)
    ));
    assert!(h.gateway().unit_mutations().is_empty());

    h.gateway().finish_deletions();
    h.reconcile_cluster("demo").await;
    assert_eq!(
        h.gateway().unit_mutations(),
        vec![GatewayCall::CreateUnit(UnitKey::pod("demo-small-worker-1"))]
    );
}

#[tokio::test]
async fn test_unit_removed_out_of_band_is_recreated() {
    let h = Harness::new();
    h.running_cluster("demo", cluster_spec(vec![worker_group("small", 1, 0, 4)]))
        .await;

    h.gateway().remove_unit(NS, &UnitKey::service("demo-head-svc"));
    h.reconcile_cluster("demo").await;

    assert_eq!(
        h.gateway().unit_mutations(),
        vec![GatewayCall::CreateUnit(UnitKey::service("demo-head-svc"))]
    );
    let head = h.cluster_status("demo").head.unwrap();
    assert_eq!(head.service_name, None);

    let status = h.settle_cluster("demo").await;
    assert_eq!(status.head.unwrap().service_name.as_deref(), Some("demo-head-svc"));
}
