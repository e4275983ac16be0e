//! Common resource generation utilities.
//!
//! Label and annotation keys, deterministic unit names, and the helpers that
//! stamp ownership onto generated objects.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{RayCluster, RayClusterSpec};

use super::units::{OwnerIdentity, UnitRole};

/// API version of every managed resource.
pub const RAY_API_VERSION: &str = "ray.io/v1alpha1";

/// Value of `app.kubernetes.io/managed-by` on every generated object.
pub const MANAGED_BY: &str = "ray-operator";

pub const LABEL_CLUSTER: &str = "ray.io/cluster";
pub const LABEL_NODE_TYPE: &str = "ray.io/node-type";
pub const LABEL_GROUP: &str = "ray.io/group";
pub const LABEL_SERVICE: &str = "ray.io/service";
pub const LABEL_JOB: &str = "ray.io/job";
pub const LABEL_ORIGINATED_FROM: &str = "ray.io/originated-from";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_CREATED_BY: &str = "app.kubernetes.io/created-by";

pub const ANNOTATION_IDENTITY_HASH: &str = "ray.io/identity-hash";
pub const ANNOTATION_MUTABLE_HASH: &str = "ray.io/mutable-hash";

/// `ray.io/group` value of the head Pod and cluster-wide units.
pub const HEAD_GROUP_NAME: &str = "headgroup";

/// Default GCS port of the head node.
pub const DEFAULT_GCS_PORT: i32 = 6379;
/// Default dashboard port of the head node (also serves the job API).
pub const DEFAULT_DASHBOARD_PORT: i32 = 8265;
/// Default Ray client port of the head node.
pub const DEFAULT_CLIENT_PORT: i32 = 10001;
/// Default Ray Serve port.
pub const DEFAULT_SERVE_PORT: i32 = 8000;

pub fn head_pod_name(cluster: &str) -> String {
    format!("{}-head", cluster)
}

pub fn worker_pod_name(cluster: &str, group: &str, index: usize) -> String {
    format!("{}-{}-worker-{}", cluster, group, index)
}

pub fn head_service_name(cluster: &str) -> String {
    format!("{}-head-svc", cluster)
}

pub fn endpoint_service_name(cluster: &str, endpoint: &str) -> String {
    format!("{}-{}", cluster, endpoint)
}

pub fn placement_group_name(cluster: &str) -> String {
    format!("ray-{}-pg", cluster)
}

pub fn serve_service_name(service: &str) -> String {
    format!("{}-serve-svc", service)
}

/// In-cluster DNS name of the head Service.
pub fn head_service_fqdn(cluster: &str, namespace: &str) -> String {
    format!("{}.{}.svc.cluster.local", head_service_name(cluster), namespace)
}

/// Standard labels applied to all units of a cluster
pub fn standard_labels(cluster: &str, role: &UnitRole) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
    labels.insert(LABEL_NODE_TYPE.to_string(), role.node_type().to_string());
    labels.insert(LABEL_GROUP.to_string(), role.group().to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels.insert(LABEL_CREATED_BY.to_string(), MANAGED_BY.to_string());
    labels
}

/// Selector matching the Pods of one role of a cluster
pub fn pod_selector_labels(cluster: &str, node_type: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster.to_string()),
        (LABEL_NODE_TYPE.to_string(), node_type.to_string()),
    ])
}

/// Attach owner reference, owner label and role labels to a generated object.
///
/// User labels already on the object are kept; operator labels win on conflict.
pub fn stamp_ownership(meta: &mut ObjectMeta, owner: &OwnerIdentity, role: &UnitRole) {
    let mut labels = meta.labels.take().unwrap_or_default();
    if let Some(cluster) = labels.get(LABEL_CLUSTER).cloned() {
        labels.extend(standard_labels(&cluster, role));
    } else {
        labels.insert(LABEL_NODE_TYPE.to_string(), role.node_type().to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
        labels.insert(LABEL_CREATED_BY.to_string(), MANAGED_BY.to_string());
    }
    labels.insert(owner.kind.selector_label().to_string(), owner.name.clone());
    meta.labels = Some(labels);
    meta.namespace = Some(owner.namespace.clone());
    meta.owner_references = Some(vec![owner.owner_reference()]);
}

/// Build a cluster controlled by a RayService or RayJob.
pub fn owned_cluster(owner: &OwnerIdentity, name: &str, spec: &RayClusterSpec) -> RayCluster {
    let mut cluster = RayCluster::new(name, spec.clone());
    cluster.metadata.namespace = Some(owner.namespace.clone());
    let labels = cluster.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(LABEL_ORIGINATED_FROM.to_string(), owner.kind.as_str().to_string());
    labels.insert(owner.kind.selector_label().to_string(), owner.name.clone());
    cluster.metadata.owner_references = Some(vec![owner.owner_reference()]);
    cluster
}

/// Remove the operator's fingerprint annotations, leaving user annotations.
pub fn user_annotations(meta: &ObjectMeta) -> BTreeMap<String, String> {
    meta.annotations
        .iter()
        .flatten()
        .filter(|(k, _)| k.as_str() != ANNOTATION_IDENTITY_HASH && k.as_str() != ANNOTATION_MUTABLE_HASH)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
