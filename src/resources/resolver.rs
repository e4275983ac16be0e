//! Desired-state resolution.
//!
//! Turns a `RayCluster` into the complete, ordered list of native units it
//! should own. Resolution is pure: the same cluster, registry and config
//! always yield the same units, names and fingerprints.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use serde::Serialize;

use crate::batch::SchedulerRegistry;
use crate::config::EngineConfig;
use crate::controller::cluster_validation::validate_spec;
use crate::controller::error::Result;
use crate::crd::{GangSchedulingSpec, RayCluster, RayClusterSpec, WorkerGroupSpec};

use super::common::{
    ANNOTATION_IDENTITY_HASH, ANNOTATION_MUTABLE_HASH, stamp_ownership, user_annotations,
    worker_pod_name,
};
use super::fingerprint::fingerprint;
use super::pods::{head_pod, worker_pod};
use super::services::{endpoint_service, head_service};
use super::units::{
    DesiredUnit, OwnerIdentity, PlacementGroup, UnitKey, UnitObject, UnitRole, namespace_of,
};

/// Units a cluster should own, sorted by mutation order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DesiredState {
    pub units: Vec<DesiredUnit>,
}

impl DesiredState {
    pub fn get(&self, key: &UnitKey) -> Option<&DesiredUnit> {
        self.units.iter().find(|u| &u.key == key)
    }

    pub fn keys(&self) -> BTreeSet<&UnitKey> {
        self.units.iter().map(|u| &u.key).collect()
    }

    /// Desired worker count per group.
    pub fn worker_counts(&self) -> BTreeMap<&str, i32> {
        let mut counts = BTreeMap::new();
        for unit in &self.units {
            if let UnitRole::Worker { group } = &unit.role {
                *counts.entry(group.as_str()).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// Gang policy in effect for a cluster: its own, else the operator default.
pub fn effective_policy(spec: &RayClusterSpec, config: &EngineConfig) -> Option<GangSchedulingSpec> {
    match (&spec.gang_scheduling, &config.default_gang_policy) {
        (Some(gang), default) => Some(GangSchedulingSpec {
            policy: gang.policy.clone().or_else(|| default.clone()),
            ..gang.clone()
        }),
        (None, Some(default)) => Some(GangSchedulingSpec {
            policy: Some(default.clone()),
            ..Default::default()
        }),
        (None, None) => None,
    }
}

/// Fingerprint of a cluster spec, used to detect spec changes across passes.
pub fn spec_fingerprint(spec: &RayClusterSpec) -> Result<String> {
    fingerprint(spec)
}

/// Worker Pod names of a group.
///
/// Indices start at 0, skip names listed in `workersToDelete`, and continue
/// until `replicas` names exist.
pub fn worker_pod_names(cluster: &str, group: &WorkerGroupSpec) -> Vec<String> {
    let skip: BTreeSet<&str> = group
        .scale_strategy
        .workers_to_delete
        .iter()
        .map(String::as_str)
        .collect();
    let wanted = usize::try_from(group.replicas.max(0)).unwrap_or_default();
    (0..)
        .map(|i| worker_pod_name(cluster, &group.group_name, i))
        .filter(|name| !skip.contains(name.as_str()))
        .take(wanted)
        .collect()
}

/// Resolve the desired units of a cluster.
///
/// Fails closed on validation errors and on unknown or invalid gang policies:
/// no units are produced for a cluster that cannot be fully resolved.
pub fn resolve(
    cluster: &RayCluster,
    registry: &SchedulerRegistry,
    config: &EngineConfig,
) -> Result<DesiredState> {
    validate_spec(cluster)?;
    let owner = OwnerIdentity::of_cluster(cluster)?;
    let name = cluster.name_any();
    let namespace = namespace_of(cluster);
    let spec = &cluster.spec;

    let policy = effective_policy(spec, config);
    let plugin = match &policy {
        Some(p) => Some(registry.resolve(p.policy.as_deref())?),
        None => None,
    };

    let mut units = Vec::new();

    if let (Some(plugin), Some(policy)) = (plugin, &policy) {
        if let Some(group) = plugin.placement_unit(cluster, policy)? {
            units.push((
                UnitRole::Placement,
                UnitObject::PlacementGroup(Box::new(group)),
            ));
        }
    }

    let mut head = head_pod(&name, &namespace, spec);
    if let (Some(plugin), Some(policy)) = (plugin, &policy) {
        plugin.annotate(&mut head, cluster, policy);
    }
    units.push((UnitRole::Head, UnitObject::Pod(Box::new(head))));

    units.push((
        UnitRole::Endpoint,
        UnitObject::Service(Box::new(head_service(&name, spec))),
    ));
    for endpoint in &spec.head_group_spec.services {
        units.push((
            UnitRole::Endpoint,
            UnitObject::Service(Box::new(endpoint_service(&name, endpoint))),
        ));
    }

    for group in &spec.worker_group_specs {
        let role = UnitRole::Worker {
            group: group.group_name.clone(),
        };
        for pod_name in worker_pod_names(&name, group) {
            let mut pod = worker_pod(pod_name, &name, &namespace, spec, group);
            if let (Some(plugin), Some(policy)) = (plugin, &policy) {
                plugin.annotate(&mut pod, cluster, policy);
            }
            units.push((role.clone(), UnitObject::Pod(Box::new(pod))));
        }
    }

    // Workers carry the head identity, so replacing the head replaces them.
    let mut head_identity: Option<String> = None;
    let mut resolved = Vec::with_capacity(units.len());
    for (role, object) in units {
        let salt = if role.is_worker() { head_identity.as_deref() } else { None };
        let unit = finish_unit(&owner, role, object, config.in_place_resize, salt)?;
        if unit.role == UnitRole::Head {
            head_identity = Some(unit.identity_hash.clone());
        }
        resolved.push(unit);
    }
    resolved.sort_by(|a, b| a.order().cmp(&b.order()));

    Ok(DesiredState { units: resolved })
}

/// Stamp ownership, compute both fingerprints and record them as annotations.
///
/// `identity_salt` is folded into the identity fingerprint of Pods.
pub fn finish_unit(
    owner: &OwnerIdentity,
    role: UnitRole,
    mut object: UnitObject,
    in_place_resize: bool,
    identity_salt: Option<&str>,
) -> Result<DesiredUnit> {
    stamp_ownership(object.metadata_mut(), owner, &role);
    let (identity_hash, mutable_hash) = unit_hashes(&object, in_place_resize, identity_salt)?;

    let annotations = object
        .metadata_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new);
    annotations.insert(ANNOTATION_IDENTITY_HASH.to_string(), identity_hash.clone());
    annotations.insert(ANNOTATION_MUTABLE_HASH.to_string(), mutable_hash.clone());

    Ok(DesiredUnit {
        key: object.key(),
        role,
        object,
        identity_hash,
        mutable_hash,
    })
}

#[derive(Serialize)]
struct PodMutable<'a> {
    labels: Option<&'a BTreeMap<String, String>>,
    annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<Vec<serde_json::Value>>,
}

#[derive(Serialize)]
struct ServiceMutable<'a> {
    labels: Option<&'a BTreeMap<String, String>>,
    selector: Option<&'a BTreeMap<String, String>>,
    ports: Option<&'a Vec<k8s_openapi::api::core::v1::ServicePort>>,
}

/// Identity and mutable fingerprints of a unit.
pub fn unit_hashes(
    object: &UnitObject,
    in_place_resize: bool,
    identity_salt: Option<&str>,
) -> Result<(String, String)> {
    match object {
        UnitObject::Pod(pod) => pod_hashes(pod, in_place_resize, identity_salt),
        UnitObject::Service(service) => service_hashes(service),
        UnitObject::PlacementGroup(group) => placement_hashes(group),
    }
}

fn pod_hashes(pod: &Pod, in_place_resize: bool, salt: Option<&str>) -> Result<(String, String)> {
    let mut identity = pod.spec.clone().unwrap_or_default();
    let mut resources = None;
    if in_place_resize {
        resources = Some(
            identity
                .containers
                .iter_mut()
                .map(|c| serde_json::to_value(c.resources.take()))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        );
    }
    let mutable = PodMutable {
        labels: pod.metadata.labels.as_ref(),
        annotations: user_annotations(&pod.metadata),
        resources,
    };
    Ok((fingerprint(&(identity, salt))?, fingerprint(&mutable)?))
}

fn service_hashes(service: &Service) -> Result<(String, String)> {
    let spec = service.spec.as_ref();
    let service_type = spec.and_then(|s| s.type_.as_deref()).unwrap_or("ClusterIP");
    let mutable = ServiceMutable {
        labels: service.metadata.labels.as_ref(),
        selector: spec.and_then(|s| s.selector.as_ref()),
        ports: spec.and_then(|s| s.ports.as_ref()),
    };
    Ok((fingerprint(service_type)?, fingerprint(&mutable)?))
}

fn placement_hashes(group: &PlacementGroup) -> Result<(String, String)> {
    Ok((
        fingerprint(&(&group.api_version, &group.kind))?,
        fingerprint(&group.spec)?,
    ))
}
