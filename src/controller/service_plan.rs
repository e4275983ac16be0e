//! RayService blue/green planning.
//!
//! [`plan`] is pure: given the service and the clusters it owns, it decides
//! which clusters to create or delete, where the serve endpoint should point
//! and what status to record once all of that has been carried out.

use std::collections::BTreeSet;
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use kube::ResourceExt;

use crate::controller::common::parse_timestamp;
use crate::controller::status::ConditionBuilder;
use crate::crd::{
    ClusterPhase, RayCluster, RayClusterSpec, RayService, RayServiceStatus, RetiringCluster,
    ServiceClusterStatus, ServicePhase,
};
use crate::resources::common::owned_cluster;
use crate::resources::fingerprint::short;
use crate::resources::OwnerIdentity;

/// Name of the cluster a service builds for a cluster-config fingerprint.
pub fn service_cluster_name(service: &str, fingerprint: &str) -> String {
    format!("{service}-raycluster-{}", short(fingerprint))
}

pub struct ServicePlanInputs<'a> {
    pub service: &'a RayService,
    pub owner: &'a OwnerIdentity,
    /// Fingerprint of `spec.rayClusterConfig`.
    pub fingerprint: &'a str,
    /// Clusters controlled by the service.
    pub owned_clusters: &'a [RayCluster],
    pub retention: Duration,
    pub now: Timestamp,
}

/// What a service pass should do.
#[derive(Debug, Clone, Default)]
pub struct ServicePlan {
    pub create: Vec<RayCluster>,
    /// Cluster the serve endpoint must select after this pass.
    pub serve_target: Option<String>,
    /// Set when the endpoint moves from one cluster to another.
    pub promoted: Option<String>,
    pub delete: Vec<String>,
    /// Status to record once every step succeeded.
    pub status: RayServiceStatus,
}

impl ServicePlan {
    /// Whether the endpoint must be written this pass.
    pub fn repoints(&self, serving: Option<&str>) -> bool {
        self.serve_target.is_some() && self.serve_target.as_deref() != serving
    }
}

fn cluster_phase(clusters: &[RayCluster], name: &str) -> Option<ClusterPhase> {
    clusters
        .iter()
        .find(|c| c.name_any() == name)
        .map(|c| c.status.as_ref().map(|s| s.phase).unwrap_or_default())
}

fn retention_deadline(now: Timestamp, retention: Duration) -> Timestamp {
    let retention = SignedDuration::try_from(retention).unwrap_or(SignedDuration::MAX);
    now.checked_add(retention).unwrap_or(Timestamp::MAX)
}

/// Plan one pass of a RayService.
pub fn plan(inputs: &ServicePlanInputs<'_>) -> ServicePlan {
    let service = inputs.service;
    let previous = service.status.clone().unwrap_or_default();
    let owned: BTreeSet<String> = inputs
        .owned_clusters
        .iter()
        .filter(|c| c.metadata.deletion_timestamp.is_none())
        .map(|c| c.name_any())
        .collect();
    let desired_name = service_cluster_name(&inputs.owner.name, inputs.fingerprint);
    let desired = ServiceClusterStatus {
        cluster_name: desired_name.clone(),
        fingerprint: inputs.fingerprint.to_string(),
    };

    let mut result = ServicePlan::default();
    let mut active = previous
        .active_service_status
        .clone()
        .filter(|a| owned.contains(&a.cluster_name));
    let mut pending = previous.pending_service_status.clone();
    let mut retiring: Vec<RetiringCluster> = previous
        .retiring_clusters
        .iter()
        .filter(|r| owned.contains(&r.cluster_name))
        .filter(|r| parse_timestamp(&r.delete_after).is_some_and(|t| t > inputs.now))
        .cloned()
        .collect();

    let ensure_pending = |result: &mut ServicePlan| {
        if !owned.contains(&desired_name) {
            result.create.push(owned_cluster(
                inputs.owner,
                &desired_name,
                &service.spec.ray_cluster_config,
            ));
        }
    };

    if active.as_ref().is_some_and(|a| a.fingerprint == inputs.fingerprint) {
        // Desired config already serving; a pending build is stale.
        pending = None;
    } else {
        match pending.take() {
            Some(p) if p.fingerprint == inputs.fingerprint => {
                let ready = cluster_phase(inputs.owned_clusters, &p.cluster_name) == Some(ClusterPhase::Running);
                if ready {
                    if let Some(old) = active.take() {
                        retiring.push(RetiringCluster {
                            cluster_name: old.cluster_name,
                            delete_after: retention_deadline(inputs.now, inputs.retention).to_string(),
                        });
                    }
                    result.promoted = Some(p.cluster_name.clone());
                    active = Some(p);
                } else {
                    ensure_pending(&mut result);
                    pending = Some(p);
                }
            }
            _ => {
                ensure_pending(&mut result);
                pending = Some(desired.clone());
            }
        }
    }

    // Anything not active, pending or retiring goes.
    let mut keep: BTreeSet<&str> = BTreeSet::new();
    keep.extend(active.iter().map(|a| a.cluster_name.as_str()));
    keep.extend(pending.iter().map(|p| p.cluster_name.as_str()));
    keep.extend(retiring.iter().map(|r| r.cluster_name.as_str()));
    result.delete = owned
        .iter()
        .filter(|name| !keep.contains(name.as_str()))
        .cloned()
        .collect();

    result.serve_target = active.as_ref().map(|a| a.cluster_name.clone());

    let phase = match (&active, &pending) {
        (None, _) => ServicePhase::Pending,
        (Some(_), Some(_)) => ServicePhase::WaitingForTarget,
        (Some(_), None) if !retiring.is_empty() => ServicePhase::Swapping,
        (Some(_), None) => ServicePhase::Running,
    };

    let generation = service.metadata.generation;
    let mut conditions = ConditionBuilder::from_existing(&previous.conditions);
    match &active {
        Some(a) => conditions.ready(true, "Serving", &format!("Serving from {}", a.cluster_name), generation),
        None => conditions.ready(false, "NoActiveCluster", "Waiting for the first cluster", generation),
    };
    match &pending {
        Some(p) => conditions.progressing(
            true,
            "BuildingCluster",
            &format!("Waiting for {} to run", p.cluster_name),
            generation,
        ),
        None => conditions.progressing(false, "Converged", "No pending cluster", generation),
    };
    conditions.spec_valid(true, "Valid", "Cluster config accepted", generation);

    result.status = RayServiceStatus {
        service_status: phase,
        active_service_status: active,
        pending_service_status: pending,
        retiring_clusters: retiring,
        conditions: conditions.build(),
        observed_generation: generation,
        last_update_time: Some(inputs.now.to_string()),
    };
    result
}

/// Time until the earliest retiring cluster expires.
pub fn next_expiry(status: &RayServiceStatus, now: Timestamp) -> Option<Duration> {
    status
        .retiring_clusters
        .iter()
        .filter_map(|r| parse_timestamp(&r.delete_after))
        .min()
        .map(|t| Duration::try_from(t.duration_since(now)).unwrap_or(Duration::ZERO))
}
