//! RayService blue/green scenarios.

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use ray_operator::controller::error::ErrorKind;
use ray_operator::controller::status::{get_condition_reason, is_condition_true};
use ray_operator::crd::{ClusterPhase, RayService, RayServiceSpec, RayServiceStatus, ServicePhase};
use ray_operator::gateway::memory::{FaultKind, GatewayOp};
use ray_operator::resources::services::selected_cluster;
use ray_operator::resources::{OwnerKind, UnitKey, UnitObject};
use ray_operator::scheduler::ReconcileOutcome;

use crate::{Harness, NS, cluster_spec, worker_group};

const SERVE_SVC: &str = "serve-serve-svc";

fn service(retention_seconds: Option<i64>) -> RayService {
    RayService::new(
        "serve",
        RayServiceSpec {
            ray_cluster_config: cluster_spec(vec![worker_group("small", 1, 0, 2)]),
            cluster_retention_seconds: retention_seconds,
            ..Default::default()
        },
    )
}

impl Harness {
    async fn reconcile_service(&self) -> ReconcileOutcome {
        self.reconcile(OwnerKind::RayService, "serve").await
    }

    fn service_status(&self) -> RayServiceStatus {
        self.gateway()
            .service(NS, "serve")
            .and_then(|s| s.status)
            .unwrap_or_default()
    }

    fn serve_endpoint(&self) -> Option<Service> {
        match self.gateway().unit(NS, &UnitKey::service(SERVE_SVC))? {
            UnitObject::Service(svc) => Some(*svc),
            _ => None,
        }
    }

    fn serving(&self) -> Option<String> {
        self.serve_endpoint()
            .and_then(|svc| selected_cluster(&svc).map(str::to_string))
    }

    fn live_cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .gateway()
            .clusters(NS)
            .into_iter()
            .filter(|c| c.metadata.deletion_timestamp.is_none())
            .map(|c| c.name_any())
            .collect();
        names.sort();
        names
    }

    /// Bring a service with one cluster to Running, returning that cluster.
    async fn serving_service(&self, retention_seconds: Option<i64>) -> String {
        self.gateway().insert_service(service(retention_seconds));
        self.reconcile_service().await;
        let first = self.live_cluster_names().remove(0);
        self.settle_cluster(&first).await;
        assert_eq!(self.reconcile_service().await, ReconcileOutcome::Done);
        first
    }
}

#[tokio::test]
async fn test_first_cluster_promoted_when_running() {
    let h = Harness::new();
    h.gateway().insert_service(service(None));

    let outcome = h.reconcile_service().await;
    assert!(matches!(outcome, ReconcileOutcome::RetryAfter(_)));
    let clusters = h.live_cluster_names();
    assert_eq!(clusters.len(), 1);
    let first = clusters[0].clone();
    assert!(first.starts_with("serve-raycluster-"));
    assert_eq!(h.service_status().service_status, ServicePhase::Pending);
    assert!(h.serve_endpoint().is_none());

    // Nothing is served while the cluster converges.
    h.reconcile_cluster(&first).await;
    h.reconcile_service().await;
    assert!(h.serve_endpoint().is_none());

    let cluster_status = h.settle_cluster(&first).await;
    assert_eq!(cluster_status.phase, ClusterPhase::Running);
    assert_eq!(h.reconcile_service().await, ReconcileOutcome::Done);

    let status = h.service_status();
    assert_eq!(status.service_status, ServicePhase::Running);
    assert_eq!(status.active_service_status.unwrap().cluster_name, first);
    assert!(status.pending_service_status.is_none());
    assert_eq!(h.serving().as_deref(), Some(first.as_str()));

    let ports = h.serve_endpoint().unwrap().spec.unwrap().ports.unwrap();
    assert_eq!(ports[0].port, 8000);

    // The service's cluster runs a head and one worker.
    assert_eq!(h.gateway().pod_names(NS, "ray.io/cluster", &first).len(), 2);
}

#[tokio::test]
async fn test_template_change_swaps_only_after_new_cluster_runs() {
    let h = Harness::new();
    let old = h.serving_service(Some(0)).await;

    h.gateway().update_service(NS, "serve", |s| {
        s.spec.ray_cluster_config.head_group_spec.template.image = "rayproject/ray:2.10.0".into();
    });
    h.reconcile_service().await;

    let clusters = h.live_cluster_names();
    assert_eq!(clusters.len(), 2);
    let new = clusters.into_iter().find(|n| n != &old).unwrap();
    let status = h.service_status();
    assert_eq!(status.service_status, ServicePhase::WaitingForTarget);
    assert_eq!(status.pending_service_status.unwrap().cluster_name, new);
    assert_eq!(h.serving().as_deref(), Some(old.as_str()));

    // The replacement is still converging; the old cluster keeps serving.
    h.reconcile_cluster(&new).await;
    h.reconcile_service().await;
    assert_eq!(h.serving().as_deref(), Some(old.as_str()));
    assert_eq!(h.service_status().service_status, ServicePhase::WaitingForTarget);

    h.settle_cluster(&new).await;
    h.reconcile_service().await;
    assert_eq!(h.serving().as_deref(), Some(new.as_str()));
    let status = h.service_status();
    assert_eq!(status.service_status, ServicePhase::Swapping);
    assert_eq!(status.active_service_status.unwrap().cluster_name, new);
    assert_eq!(status.retiring_clusters.len(), 1);
    assert_eq!(status.retiring_clusters[0].cluster_name, old);

    // Retention is zero: the next pass tears the old cluster down.
    assert_eq!(h.reconcile_service().await, ReconcileOutcome::Done);
    assert_eq!(h.service_status().service_status, ServicePhase::Running);
    assert!(h.service_status().retiring_clusters.is_empty());

    h.reconcile_cluster(&old).await;
    assert_eq!(h.live_cluster_names(), vec![new.clone()]);
    assert!(h.gateway().cluster(NS, &old).is_none());
    assert!(h.gateway().pod_names(NS, "ray.io/cluster", &old).is_empty());
    assert_eq!(h.gateway().pod_names(NS, "ray.io/cluster", &new).len(), 2);
}

#[tokio::test]
async fn test_failed_repoint_keeps_old_cluster_serving() {
    let h = Harness::new();
    let old = h.serving_service(None).await;

    h.gateway().update_service(NS, "serve", |s| {
        s.spec.ray_cluster_config.worker_group_specs[0].replicas = 2;
    });
    h.reconcile_service().await;
    let new = h.live_cluster_names().into_iter().find(|n| n != &old).unwrap();
    h.settle_cluster(&new).await;

    h.gateway()
        .fail(GatewayOp::UpdateUnit, Some(SERVE_SVC), 1, FaultKind::Conflict);
    let before = h.service_status();
    assert!(matches!(h.reconcile_service().await, ReconcileOutcome::Error(_)));
    assert_eq!(h.service_status(), before);
    assert_eq!(h.serving().as_deref(), Some(old.as_str()));

    h.reconcile_service().await;
    assert_eq!(h.serving().as_deref(), Some(new.as_str()));
    let status = h.service_status();
    assert_eq!(status.active_service_status.unwrap().cluster_name, new);
    assert_eq!(status.retiring_clusters[0].cluster_name, old);
}

#[tokio::test]
async fn test_removing_service_collects_its_clusters() {
    let h = Harness::new();
    let cluster = h.serving_service(None).await;

    h.gateway().remove_service(NS, "serve");
    assert!(h.gateway().service(NS, "serve").is_none());
    assert!(h.serve_endpoint().is_none());

    // Owned clusters are marked for deletion and swept by their reconciler.
    let doomed = h.gateway().cluster(NS, &cluster).unwrap();
    assert!(doomed.metadata.deletion_timestamp.is_some());
    assert_eq!(h.reconcile_cluster(&cluster).await, ReconcileOutcome::Done);
    assert!(h.gateway().clusters(NS).is_empty());
    assert!(h.gateway().units(NS).is_empty());
}

#[tokio::test]
async fn test_invalid_cluster_config_is_rejected() {
    let h = Harness::new();
    let mut invalid = service(None);
    invalid.spec.ray_cluster_config.worker_group_specs[0].replicas = 9;
    h.gateway().insert_service(invalid);

    assert!(matches!(h.reconcile_service().await, ReconcileOutcome::Error(_)));
    assert!(h.gateway().clusters(NS).is_empty());
    assert!(h.warnings("serve").contains(&"InvalidSpec".to_string()));
}

#[tokio::test]
async fn test_service_name_too_long_for_its_clusters_is_reported() {
    let h = Harness::new();
    let name = "recommendation-serving";
    let mut long = service(None);
    long.metadata.name = Some(name.into());
    h.gateway().insert_service(long);

    for _ in 0..2 {
        assert_eq!(
            h.reconcile(OwnerKind::RayService, name).await,
            ReconcileOutcome::Error(ErrorKind::Configuration)
        );
    }
    assert!(h.gateway().clusters(NS).is_empty());
    assert_eq!(h.warnings(name), vec!["InvalidSpec".to_string()]);

    let status = h.gateway().service(NS, name).unwrap().status.unwrap();
    assert_eq!(status.service_status, ServicePhase::Pending);
    assert!(!is_condition_true(&status.conditions, "SpecValid"));
    assert_eq!(get_condition_reason(&status.conditions, "SpecValid"), Some("InvalidSpec"));
}
