//! Shared fixtures: an in-memory platform behind the real dispatcher.

use std::sync::Arc;

use ray_operator::batch::SchedulerRegistry;
use ray_operator::config::EngineConfig;
use ray_operator::controller::Dispatcher;
use ray_operator::controller::context::Context;
use ray_operator::crd::{
    ClusterPhase, ContainerTemplate, HeadGroupSpec, RayCluster, RayClusterSpec, RayClusterStatus, WorkerGroupSpec,
};
use ray_operator::gateway::{EventSeverity, InMemoryGateway};
use ray_operator::resources::OwnerKind;
use ray_operator::scheduler::{ObjectKey, ReconcileOutcome, Reconciler};
use ray_operator::submission::InMemorySubmissionClient;

pub const NS: &str = "default";
pub const IMAGE: &str = "rayproject/ray:2.9.0";

/// Upper bound of passes a scenario may need to settle.
const MAX_PASSES: usize = 10;

pub fn template(image: &str) -> ContainerTemplate {
    ContainerTemplate {
        image: image.into(),
        ..Default::default()
    }
}

pub fn worker_group(name: &str, replicas: i32, min: i32, max: i32) -> WorkerGroupSpec {
    WorkerGroupSpec {
        group_name: name.into(),
        replicas,
        min_replicas: min,
        max_replicas: max,
        template: template(IMAGE),
        ..Default::default()
    }
}

pub fn cluster_spec(groups: Vec<WorkerGroupSpec>) -> RayClusterSpec {
    RayClusterSpec {
        ray_version: "2.9.0".into(),
        head_group_spec: HeadGroupSpec {
            template: template(IMAGE),
            ..Default::default()
        },
        worker_group_specs: groups,
        ..Default::default()
    }
}

pub struct Harness {
    dispatcher: Dispatcher<InMemoryGateway, InMemorySubmissionClient>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let ctx = Context::new(
            Arc::new(InMemoryGateway::new()),
            Arc::new(SchedulerRegistry::from_config(true)),
            config,
            Arc::new(InMemorySubmissionClient::new()),
        );
        Self {
            dispatcher: Dispatcher::new(Arc::new(ctx)),
        }
    }

    pub fn gateway(&self) -> &InMemoryGateway {
        &self.dispatcher.context().gateway
    }

    pub fn submission(&self) -> &InMemorySubmissionClient {
        &self.dispatcher.context().submission
    }

    pub async fn reconcile(&self, kind: OwnerKind, name: &str) -> ReconcileOutcome {
        self.dispatcher.reconcile(&ObjectKey::new(kind, NS, name)).await
    }

    pub async fn reconcile_cluster(&self, name: &str) -> ReconcileOutcome {
        self.reconcile(OwnerKind::RayCluster, name).await
    }

    /// Reconcile a cluster, marking its Pods ready after every pass, until
    /// a pass reports `Done`.
    pub async fn settle_cluster(&self, name: &str) -> RayClusterStatus {
        for _ in 0..MAX_PASSES {
            let outcome = self.reconcile_cluster(name).await;
            self.gateway().mark_all_pods_ready(NS);
            if outcome == ReconcileOutcome::Done {
                return self.cluster_status(name);
            }
        }
        panic!("RayCluster {name} did not settle in {MAX_PASSES} passes");
    }

    /// Insert a cluster and drive it to Running.
    pub async fn running_cluster(&self, name: &str, spec: RayClusterSpec) -> RayCluster {
        self.gateway().insert_cluster(RayCluster::new(name, spec));
        let status = self.settle_cluster(name).await;
        assert_eq!(status.phase, ClusterPhase::Running);
        self.gateway().clear_calls();
        self.gateway().cluster(NS, name).unwrap()
    }

    pub fn cluster_status(&self, name: &str) -> RayClusterStatus {
        self.gateway()
            .cluster(NS, name)
            .and_then(|c| c.status)
            .unwrap_or_default()
    }

    /// Reasons of the warning events recorded for `name`.
    pub fn warnings(&self, name: &str) -> Vec<String> {
        self.gateway()
            .events()
            .into_iter()
            .filter(|e| e.name == name && e.severity == EventSeverity::Warning)
            .map(|e| e.reason)
            .collect()
    }
}
