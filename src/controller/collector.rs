//! Observed-state collection.
//!
//! Lists the units selected by an owner's label, keeps only those whose owner
//! references carry the owner's uid, and normalizes them for the diff engine.

use std::time::Duration;

use jiff::Timestamp;
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use tracing::debug;

use crate::controller::error::Result;
use crate::gateway::ApiGateway;
use crate::resources::common::{ANNOTATION_IDENTITY_HASH, ANNOTATION_MUTABLE_HASH};
use crate::resources::units::{OwnerIdentity, UnitKey, UnitObject, UnitRole};

/// Health of an observed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitHealth {
    Ready,
    /// Not ready since the given time, when known.
    NotReady { since: Option<Timestamp> },
    /// Exited; never comes back by itself. `since` is when it stopped, when known.
    Failed { since: Option<Timestamp> },
    /// Deletion requested but not complete.
    Terminating,
}

/// A unit as currently seen on the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedUnit {
    pub key: UnitKey,
    pub role: UnitRole,
    pub resource_version: Option<String>,
    pub identity_hash: Option<String>,
    pub mutable_hash: Option<String>,
    pub health: UnitHealth,
    pub pod_ip: Option<String>,
    pub cluster_ip: Option<String>,
}

impl ObservedUnit {
    pub fn is_ready(&self) -> bool {
        self.health == UnitHealth::Ready
    }

    pub fn is_terminating(&self) -> bool {
        self.health == UnitHealth::Terminating
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.health, UnitHealth::Failed { .. })
    }

    /// How long the unit has been unhealthy at `now`.
    ///
    /// Terminating and ready units are not unhealthy.
    pub fn unhealthy_for(&self, now: Timestamp) -> Option<Duration> {
        match &self.health {
            UnitHealth::NotReady { since: Some(since) } | UnitHealth::Failed { since: Some(since) } => {
                let elapsed = now.duration_since(*since);
                Some(Duration::try_from(elapsed).unwrap_or(Duration::ZERO))
            }
            UnitHealth::NotReady { since: None } | UnitHealth::Failed { since: None } => Some(Duration::ZERO),
            UnitHealth::Ready | UnitHealth::Terminating => None,
        }
    }
}

/// When the last container of a stopped Pod terminated, falling back to
/// the Ready condition turning false and then to the Pod's creation.
fn stopped_since(pod: &Pod, ready: Option<&PodCondition>) -> Option<Timestamp> {
    let terminated = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|c| c.state.as_ref()?.terminated.as_ref()?.finished_at.as_ref())
        .map(|t| t.0)
        .max();
    terminated
        .or_else(|| {
            ready
                .filter(|c| c.status != "True")
                .and_then(|c| c.last_transition_time.as_ref())
                .map(|t| t.0)
        })
        .or_else(|| pod.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

fn pod_health(pod: &Pod) -> UnitHealth {
    if pod.metadata.deletion_timestamp.is_some() {
        return UnitHealth::Terminating;
    }
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"));
    if matches!(
        status.and_then(|s| s.phase.as_deref()),
        Some("Failed") | Some("Succeeded")
    ) {
        return UnitHealth::Failed {
            since: stopped_since(pod, ready),
        };
    }
    match ready {
        Some(cond) if cond.status == "True" => UnitHealth::Ready,
        Some(cond) => UnitHealth::NotReady {
            since: cond
                .last_transition_time
                .as_ref()
                .map(|t| t.0)
                .or_else(|| pod.metadata.creation_timestamp.as_ref().map(|t| t.0)),
        },
        None => UnitHealth::NotReady {
            since: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
        },
    }
}

/// Normalize a platform object.
pub fn observe(object: &UnitObject) -> ObservedUnit {
    let meta = object.metadata();
    let (health, pod_ip, cluster_ip) = match object {
        UnitObject::Pod(pod) => (
            pod_health(pod),
            pod.status.as_ref().and_then(|s| s.pod_ip.clone()),
            None,
        ),
        UnitObject::Service(service) => (
            if meta.deletion_timestamp.is_some() {
                UnitHealth::Terminating
            } else {
                UnitHealth::Ready
            },
            None,
            service.spec.as_ref().and_then(|s| s.cluster_ip.clone()),
        ),
        UnitObject::PlacementGroup(_) => (
            if meta.deletion_timestamp.is_some() {
                UnitHealth::Terminating
            } else {
                UnitHealth::Ready
            },
            None,
            None,
        ),
    };

    ObservedUnit {
        key: object.key(),
        role: UnitRole::from_labels(meta),
        resource_version: meta.resource_version.clone(),
        identity_hash: object.annotation(ANNOTATION_IDENTITY_HASH).map(str::to_string),
        mutable_hash: object.annotation(ANNOTATION_MUTABLE_HASH).map(str::to_string),
        health,
        pod_ip,
        cluster_ip,
    }
}

/// Collect the units owned by `owner`.
pub async fn collect<G: ApiGateway>(gateway: &G, owner: &OwnerIdentity) -> Result<Vec<ObservedUnit>> {
    let objects = gateway.list_units(owner).await?;
    let total = objects.len();
    let mut observed: Vec<ObservedUnit> = objects
        .iter()
        .filter(|o| o.is_owned_by(&owner.uid))
        .map(observe)
        .collect();
    observed.sort_by(|a, b| a.key.cmp(&b.key));
    if observed.len() != total {
        debug!(
            owner = %owner.name,
            skipped = total - observed.len(),
            "Ignoring selected objects not owned by this resource"
        );
    }
    Ok(observed)
}
