//! Native unit model shared by the resolver, collector and diff engine.
//!
//! A native unit is a platform object (Pod, Service, placement group) owned
//! by exactly one managed resource. Units are identified by kind and name;
//! their content is compared through two fingerprints stored as annotations.

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::controller::error::{Error, Result};
use crate::crd::{RayCluster, RayJob, RayService};

use super::common::{
    HEAD_GROUP_NAME, LABEL_CLUSTER, LABEL_GROUP, LABEL_JOB, LABEL_NODE_TYPE, LABEL_SERVICE,
    RAY_API_VERSION,
};

/// Kind of a native unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    PlacementGroup,
    Pod,
    Service,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitKind::PlacementGroup => write!(f, "PlacementGroup"),
            UnitKind::Pod => write!(f, "Pod"),
            UnitKind::Service => write!(f, "Service"),
        }
    }
}

/// Identity of a unit within its namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub kind: UnitKind,
    pub name: String,
}

impl UnitKey {
    pub fn new(kind: UnitKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn pod(name: impl Into<String>) -> Self {
        Self::new(UnitKind::Pod, name)
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self::new(UnitKind::Service, name)
    }
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Role of a unit within its owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitRole {
    Placement,
    Head,
    Endpoint,
    Serve,
    Worker { group: String },
}

impl UnitRole {
    /// Mutation order: placement before head, head before endpoints,
    /// endpoints before workers.
    pub fn rank(&self) -> u8 {
        match self {
            UnitRole::Placement => 0,
            UnitRole::Head => 1,
            UnitRole::Endpoint | UnitRole::Serve => 2,
            UnitRole::Worker { .. } => 3,
        }
    }

    /// Value of the `ray.io/node-type` label.
    pub fn node_type(&self) -> &'static str {
        match self {
            UnitRole::Placement => "placement",
            UnitRole::Head => "head",
            UnitRole::Endpoint => "endpoint",
            UnitRole::Serve => "serve",
            UnitRole::Worker { .. } => "worker",
        }
    }

    /// Value of the `ray.io/group` label.
    pub fn group(&self) -> &str {
        match self {
            UnitRole::Worker { group } => group,
            _ => HEAD_GROUP_NAME,
        }
    }

    /// Recover the role from unit labels. Unlabelled units are endpoints.
    pub fn from_labels(meta: &ObjectMeta) -> Self {
        let labels = meta.labels.as_ref();
        let node_type = labels.and_then(|l| l.get(LABEL_NODE_TYPE)).map(String::as_str);
        match node_type {
            Some("placement") => UnitRole::Placement,
            Some("head") => UnitRole::Head,
            Some("serve") => UnitRole::Serve,
            Some("worker") => UnitRole::Worker {
                group: labels
                    .and_then(|l| l.get(LABEL_GROUP))
                    .cloned()
                    .unwrap_or_default(),
            },
            _ => UnitRole::Endpoint,
        }
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, UnitRole::Worker { .. })
    }
}

/// Provider-specific gang-scheduling object.
///
/// The spec is opaque to the engine; plugins serialize their typed spec into it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementGroup {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
}

/// A concrete platform object backing a unit.
#[derive(Clone, Debug, PartialEq)]
pub enum UnitObject {
    Pod(Box<Pod>),
    Service(Box<Service>),
    PlacementGroup(Box<PlacementGroup>),
}

impl UnitObject {
    pub fn kind(&self) -> UnitKind {
        match self {
            UnitObject::Pod(_) => UnitKind::Pod,
            UnitObject::Service(_) => UnitKind::Service,
            UnitObject::PlacementGroup(_) => UnitKind::PlacementGroup,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            UnitObject::Pod(p) => &p.metadata,
            UnitObject::Service(s) => &s.metadata,
            UnitObject::PlacementGroup(g) => &g.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            UnitObject::Pod(p) => &mut p.metadata,
            UnitObject::Service(s) => &mut s.metadata,
            UnitObject::PlacementGroup(g) => &mut g.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn key(&self) -> UnitKey {
        UnitKey::new(self.kind(), self.name())
    }

    /// Whether the owner references of this object include `uid`.
    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.metadata()
            .owner_references
            .as_ref()
            .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }
}

/// A unit the resolver wants to exist.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredUnit {
    pub key: UnitKey,
    pub role: UnitRole,
    pub object: UnitObject,
    /// Fingerprint of fields that can only change by recreating the unit.
    pub identity_hash: String,
    /// Fingerprint of fields that can be updated in place.
    pub mutable_hash: String,
}

impl DesiredUnit {
    /// Sort key implementing the mutation order.
    pub fn order(&self) -> (u8, &UnitKey) {
        (self.role.rank(), &self.key)
    }
}

/// Kind of a managed resource that owns units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OwnerKind {
    RayCluster,
    RayService,
    RayJob,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::RayCluster => "RayCluster",
            OwnerKind::RayService => "RayService",
            OwnerKind::RayJob => "RayJob",
        }
    }

    /// Label carried by every object owned by a resource of this kind.
    pub fn selector_label(&self) -> &'static str {
        match self {
            OwnerKind::RayCluster => LABEL_CLUSTER,
            OwnerKind::RayService => LABEL_SERVICE,
            OwnerKind::RayJob => LABEL_JOB,
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "RayCluster" => Some(OwnerKind::RayCluster),
            "RayService" => Some(OwnerKind::RayService),
            "RayJob" => Some(OwnerKind::RayJob),
            _ => None,
        }
    }
}

impl std::fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a managed resource: kind, namespace, name and uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerIdentity {
    pub kind: OwnerKind,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl OwnerIdentity {
    fn from_meta(kind: OwnerKind, meta: &ObjectMeta) -> Result<Self> {
        let name = meta
            .name
            .clone()
            .ok_or_else(|| Error::MissingField(format!("{kind} metadata.name")))?;
        let uid = meta
            .uid
            .clone()
            .ok_or_else(|| Error::MissingField(format!("{kind} {name} metadata.uid")))?;
        Ok(Self {
            kind,
            namespace: meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name,
            uid,
        })
    }

    pub fn of_cluster(cluster: &RayCluster) -> Result<Self> {
        Self::from_meta(OwnerKind::RayCluster, &cluster.metadata)
    }

    pub fn of_service(service: &RayService) -> Result<Self> {
        Self::from_meta(OwnerKind::RayService, &service.metadata)
    }

    pub fn of_job(job: &RayJob) -> Result<Self> {
        Self::from_meta(OwnerKind::RayJob, &job.metadata)
    }

    /// Label selector matching the objects owned by this resource.
    pub fn label_selector(&self) -> String {
        format!("{}={}", self.kind.selector_label(), self.name)
    }

    /// Controller owner reference pointing at this resource.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: RAY_API_VERSION.to_string(),
            kind: self.kind.as_str().to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// Controller owner of an object, if it is one of ours.
pub fn controller_owner(meta: &ObjectMeta) -> Option<(OwnerKind, String)> {
    meta.owner_references.as_ref()?.iter().find_map(|r| {
        if r.controller != Some(true) || !r.api_version.starts_with("ray.io/") {
            return None;
        }
        OwnerKind::from_kind(&r.kind).map(|k| (k, r.name.clone()))
    })
}

/// Namespace of a managed resource, defaulting like the platform does.
pub fn namespace_of<K: ResourceExt>(resource: &K) -> String {
    resource.namespace().unwrap_or_else(|| "default".to_string())
}
