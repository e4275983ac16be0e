//! In-memory platform for tests.
//!
//! Behaves like a small API server: it assigns uids and resource versions,
//! enforces name uniqueness and version preconditions, honors finalizers and
//! garbage-collects objects whose controller owner is gone. Tests drive the
//! parts a kubelet would (Pod readiness, deletion settlement) explicitly and
//! can hide fresh objects from the next list or inject faults.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use jiff::Timestamp;
use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::crd::{RayCluster, RayClusterStatus, RayJob, RayJobStatus, RayService, RayServiceStatus};
use crate::resources::units::{DesiredUnit, OwnerIdentity, OwnerKind, UnitKey, UnitObject};
use crate::scheduler::ObjectKey;

use super::{ApiGateway, CLUSTER_FINALIZER, EventRecord};

/// Gateway operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    ListUnits,
    CreateUnit,
    UpdateUnit,
    DeleteUnit,
    GetCluster,
    CreateCluster,
    DeleteCluster,
    PatchClusterStatus,
    PatchServiceStatus,
    PatchJobStatus,
}

/// Error returned by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Conflict,
    Transient,
    NotFound,
    /// Permanent refusal, e.g. an admission or quota denial.
    Rejected,
}

impl FaultKind {
    fn error(&self, target: &str) -> Error {
        match self {
            FaultKind::Conflict => Error::Conflict(format!("{target} was modified")),
            FaultKind::Transient => Error::Transient(format!("injected failure on {target}")),
            FaultKind::NotFound => Error::NotFound(target.to_string()),
            FaultKind::Rejected => Error::Rejected(format!("{target} refused by admission")),
        }
    }
}

/// A successful write, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    CreateUnit(UnitKey),
    UpdateUnit(UnitKey),
    DeleteUnit(UnitKey),
    CreateCluster(String),
    DeleteCluster(String),
    PatchClusterStatus(String),
    PatchServiceStatus(String),
    PatchJobStatus(String),
}

impl GatewayCall {
    /// Whether the call changed a native unit.
    pub fn is_unit_mutation(&self) -> bool {
        matches!(
            self,
            GatewayCall::CreateUnit(_) | GatewayCall::UpdateUnit(_) | GatewayCall::DeleteUnit(_)
        )
    }
}

#[derive(Debug)]
struct ArmedFault {
    op: GatewayOp,
    name: Option<String>,
    remaining: usize,
    kind: FaultKind,
}

#[derive(Debug)]
struct StoredUnit {
    object: UnitObject,
    /// Number of upcoming lists this object is hidden from.
    hidden_lists: u32,
}

type Key = (String, String);

#[derive(Debug, Default)]
struct State {
    clusters: BTreeMap<Key, RayCluster>,
    services: BTreeMap<Key, RayService>,
    jobs: BTreeMap<Key, RayJob>,
    units: BTreeMap<(String, UnitKey), StoredUnit>,
    hide_new_units: bool,
    graceful_deletion: bool,
    faults: Vec<ArmedFault>,
    calls: Vec<GatewayCall>,
    events: Vec<EventRecord>,
    counter: u64,
}

impl State {
    fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn check_fault(&mut self, op: GatewayOp, name: &str) -> Result<()> {
        let fault = self.faults.iter_mut().find(|f| {
            f.op == op && f.remaining > 0 && f.name.as_deref().is_none_or(|n| n == name)
        });
        match fault {
            Some(fault) => {
                fault.remaining -= 1;
                Err(fault.kind.error(name))
            }
            None => Ok(()),
        }
    }

    /// Fill in the fields the API server owns on create.
    fn admit(&mut self, meta: &mut ObjectMeta) {
        let n = self.next();
        meta.uid = Some(format!("uid-{n}"));
        meta.resource_version = Some(n.to_string());
        meta.creation_timestamp = Some(Time(Timestamp::now()));
        meta.namespace.get_or_insert_with(|| "default".to_string());
        meta.generation.get_or_insert(1);
    }

    fn live_uids(&self) -> Vec<String> {
        self.clusters
            .values()
            .filter_map(|c| c.metadata.uid.clone())
            .chain(self.services.values().filter_map(|s| s.metadata.uid.clone()))
            .chain(self.jobs.values().filter_map(|j| j.metadata.uid.clone()))
            .collect()
    }

    fn request_cluster_deletion(&mut self, key: &Key) {
        let n = self.next();
        let Some(cluster) = self.clusters.get_mut(key) else {
            return;
        };
        if cluster.finalizers().is_empty() {
            self.clusters.remove(key);
            self.collect_garbage();
        } else if cluster.metadata.deletion_timestamp.is_none() {
            cluster.metadata.deletion_timestamp = Some(Time(Timestamp::now()));
            cluster.metadata.resource_version = Some(n.to_string());
        }
    }

    /// Remove objects whose owner references all point at deleted owners.
    fn collect_garbage(&mut self) {
        loop {
            let live = self.live_uids();
            let orphaned = |meta: &ObjectMeta| {
                meta.owner_references
                    .as_ref()
                    .is_some_and(|refs| !refs.is_empty() && refs.iter().all(|r| !live.contains(&r.uid)))
            };

            let units_before = self.units.len();
            self.units.retain(|_, u| !orphaned(u.object.metadata()));

            let doomed: Vec<Key> = self
                .clusters
                .iter()
                .filter(|(_, c)| orphaned(&c.metadata) && c.metadata.deletion_timestamp.is_none())
                .map(|(k, _)| k.clone())
                .collect();

            let changed = units_before != self.units.len() || !doomed.is_empty();
            for key in &doomed {
                if let Some(cluster) = self.clusters.get_mut(key) {
                    if cluster.finalizers().is_empty() {
                        self.clusters.remove(key);
                    } else {
                        cluster.metadata.deletion_timestamp = Some(Time(Timestamp::now()));
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }
}

/// Deterministic in-process platform.
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    state: Mutex<State>,
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn namespace_or_default(meta: &ObjectMeta) -> String {
    meta.namespace.clone().unwrap_or_else(|| "default".to_string())
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hide every newly created unit from the next list of its owner.
    pub fn set_hide_new_units(&self, hide: bool) {
        self.state().hide_new_units = hide;
    }

    /// Keep deleted units as terminating until [`Self::finish_deletions`].
    pub fn set_graceful_deletion(&self, graceful: bool) {
        self.state().graceful_deletion = graceful;
    }

    /// Fail the next `times` calls of `op`, optionally only for object `name`.
    pub fn fail(&self, op: GatewayOp, name: Option<&str>, times: usize, kind: FaultKind) {
        self.state().faults.push(ArmedFault {
            op,
            name: name.map(str::to_string),
            remaining: times,
            kind,
        });
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    pub fn insert_cluster(&self, mut cluster: RayCluster) -> RayCluster {
        let mut state = self.state();
        state.admit(&mut cluster.metadata);
        let k = key(&namespace_or_default(&cluster.metadata), &cluster.name_any());
        state.clusters.insert(k, cluster.clone());
        cluster
    }

    pub fn insert_service(&self, mut service: RayService) -> RayService {
        let mut state = self.state();
        state.admit(&mut service.metadata);
        let k = key(&namespace_or_default(&service.metadata), &service.name_any());
        state.services.insert(k, service.clone());
        service
    }

    pub fn insert_job(&self, mut job: RayJob) -> RayJob {
        let mut state = self.state();
        state.admit(&mut job.metadata);
        let k = key(&namespace_or_default(&job.metadata), &job.name_any());
        state.jobs.insert(k, job.clone());
        job
    }

    /// Edit a cluster's spec the way a user would, bumping its generation.
    pub fn update_cluster(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut RayCluster)) {
        let mut state = self.state();
        let n = state.next();
        if let Some(cluster) = state.clusters.get_mut(&key(namespace, name)) {
            edit(cluster);
            cluster.metadata.generation = Some(cluster.metadata.generation.unwrap_or(0) + 1);
            cluster.metadata.resource_version = Some(n.to_string());
        }
    }

    pub fn update_service(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut RayService)) {
        let mut state = self.state();
        let n = state.next();
        if let Some(service) = state.services.get_mut(&key(namespace, name)) {
            edit(service);
            service.metadata.generation = Some(service.metadata.generation.unwrap_or(0) + 1);
            service.metadata.resource_version = Some(n.to_string());
        }
    }

    pub fn cluster(&self, namespace: &str, name: &str) -> Option<RayCluster> {
        self.state().clusters.get(&key(namespace, name)).cloned()
    }

    pub fn clusters(&self, namespace: &str) -> Vec<RayCluster> {
        self.state()
            .clusters
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<RayService> {
        self.state().services.get(&key(namespace, name)).cloned()
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<RayJob> {
        self.state().jobs.get(&key(namespace, name)).cloned()
    }

    /// User-initiated deletion of a cluster; honors finalizers.
    pub fn remove_cluster(&self, namespace: &str, name: &str) {
        self.state().request_cluster_deletion(&key(namespace, name));
    }

    /// User-initiated deletion of a service; owned objects are collected.
    pub fn remove_service(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        state.services.remove(&key(namespace, name));
        state.collect_garbage();
    }

    /// User-initiated deletion of a job; owned objects are collected.
    pub fn remove_job(&self, namespace: &str, name: &str) {
        let mut state = self.state();
        state.jobs.remove(&key(namespace, name));
        state.collect_garbage();
    }

    /// All units in a namespace, including hidden and terminating ones.
    pub fn units(&self, namespace: &str) -> Vec<UnitObject> {
        self.state()
            .units
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, u)| u.object.clone())
            .collect()
    }

    pub fn unit(&self, namespace: &str, unit: &UnitKey) -> Option<UnitObject> {
        self.state()
            .units
            .get(&(namespace.to_string(), unit.clone()))
            .map(|u| u.object.clone())
    }

    /// Names of the Pods in a namespace that carry `label=value`.
    pub fn pod_names(&self, namespace: &str, label: &str, value: &str) -> Vec<String> {
        self.units(namespace)
            .into_iter()
            .filter(|u| matches!(u, UnitObject::Pod(_)))
            .filter(|u| {
                u.metadata()
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(label))
                    .is_some_and(|v| v == value)
            })
            .map(|u| u.name().to_string())
            .collect()
    }

    /// Set a Pod's Ready condition. `since` defaults to now.
    pub fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool, since: Option<Timestamp>) {
        let mut state = self.state();
        let n = state.next();
        if let Some(stored) = state.units.get_mut(&(namespace.to_string(), UnitKey::pod(name)))
            && let UnitObject::Pod(pod) = &mut stored.object
        {
            let status = pod.status.get_or_insert_with(PodStatus::default);
            status.phase = Some("Running".to_string());
            status.pod_ip.get_or_insert_with(|| format!("10.244.0.{}", n % 250));
            status.conditions = Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                last_transition_time: Some(Time(since.unwrap_or_else(Timestamp::now))),
                ..Default::default()
            }]);
            pod.metadata.resource_version = Some(n.to_string());
        }
    }

    /// Mark every non-terminating Pod in a namespace Ready.
    pub fn mark_all_pods_ready(&self, namespace: &str) {
        let names: Vec<String> = self
            .units(namespace)
            .iter()
            .filter(|u| matches!(u, UnitObject::Pod(_)))
            .filter(|u| u.metadata().deletion_timestamp.is_none())
            .map(|u| u.name().to_string())
            .collect();
        for name in names {
            self.set_pod_ready(namespace, &name, true, None);
        }
    }

    /// Set a Pod's phase, e.g. `Failed`.
    ///
    /// A terminal phase also turns the Ready condition false as of now, the
    /// way the kubelet reports a stopped Pod.
    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str) {
        let mut state = self.state();
        let n = state.next();
        if let Some(stored) = state.units.get_mut(&(namespace.to_string(), UnitKey::pod(name)))
            && let UnitObject::Pod(pod) = &mut stored.object
        {
            let status = pod.status.get_or_insert_with(PodStatus::default);
            status.phase = Some(phase.to_string());
            if matches!(phase, "Failed" | "Succeeded") {
                status.conditions = Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "False".to_string(),
                    last_transition_time: Some(Time(Timestamp::now())),
                    ..Default::default()
                }]);
            }
            pod.metadata.resource_version = Some(n.to_string());
        }
    }

    /// Remove a unit behind the operator's back.
    pub fn remove_unit(&self, namespace: &str, unit: &UnitKey) {
        self.state().units.remove(&(namespace.to_string(), unit.clone()));
    }

    /// Complete every pending graceful deletion.
    pub fn finish_deletions(&self) {
        self.state()
            .units
            .retain(|_, u| u.object.metadata().deletion_timestamp.is_none());
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    /// Unit mutations since the last [`Self::clear_calls`].
    pub fn unit_mutations(&self) -> Vec<GatewayCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.is_unit_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.state().events.clone()
    }
}

impl ApiGateway for InMemoryGateway {
    async fn list_units(&self, owner: &OwnerIdentity) -> Result<Vec<UnitObject>> {
        let mut state = self.state();
        state.check_fault(GatewayOp::ListUnits, &owner.name)?;
        let label = owner.kind.selector_label();
        let mut units = Vec::new();
        for ((ns, _), stored) in state.units.iter_mut() {
            if ns != &owner.namespace {
                continue;
            }
            let selected = stored
                .object
                .metadata()
                .labels
                .as_ref()
                .and_then(|l| l.get(label))
                .is_some_and(|v| v == &owner.name);
            if !selected {
                continue;
            }
            if stored.hidden_lists > 0 {
                stored.hidden_lists -= 1;
                continue;
            }
            units.push(stored.object.clone());
        }
        Ok(units)
    }

    async fn create_unit(&self, namespace: &str, unit: &DesiredUnit) -> Result<()> {
        let mut state = self.state();
        state.check_fault(GatewayOp::CreateUnit, &unit.key.name)?;
        let slot = (namespace.to_string(), unit.key.clone());
        if state.units.contains_key(&slot) {
            return Err(Error::AlreadyExists(unit.key.to_string()));
        }

        let mut object = unit.object.clone();
        state.admit(object.metadata_mut());
        object.metadata_mut().namespace = Some(namespace.to_string());
        let n = state.counter;
        match &mut object {
            UnitObject::Pod(pod) => {
                pod.status = Some(PodStatus {
                    phase: Some("Pending".to_string()),
                    ..Default::default()
                });
            }
            UnitObject::Service(service) => {
                if let Some(spec) = service.spec.as_mut() {
                    spec.cluster_ip.get_or_insert_with(|| format!("10.96.0.{}", n % 250));
                }
            }
            UnitObject::PlacementGroup(_) => {}
        }

        let hidden_lists = u32::from(state.hide_new_units);
        state.units.insert(slot, StoredUnit { object, hidden_lists });
        state.calls.push(GatewayCall::CreateUnit(unit.key.clone()));
        Ok(())
    }

    async fn update_unit(
        &self,
        namespace: &str,
        unit: &DesiredUnit,
        resource_version: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state();
        state.check_fault(GatewayOp::UpdateUnit, &unit.key.name)?;
        let n = state.next();
        let stored = state
            .units
            .get_mut(&(namespace.to_string(), unit.key.clone()))
            .ok_or_else(|| Error::NotFound(unit.key.to_string()))?;

        let current = stored.object.metadata().resource_version.as_deref();
        if resource_version.is_some() && resource_version != current {
            return Err(Error::Conflict(unit.key.to_string()));
        }

        let desired_meta = unit.object.metadata();
        let meta = stored.object.metadata_mut();
        meta.labels = desired_meta.labels.clone();
        meta.annotations = desired_meta.annotations.clone();
        meta.resource_version = Some(n.to_string());

        match (&mut stored.object, &unit.object) {
            (UnitObject::Service(observed), UnitObject::Service(desired)) => {
                if let (Some(observed), Some(desired)) = (observed.spec.as_mut(), desired.spec.as_ref()) {
                    observed.selector = desired.selector.clone();
                    observed.ports = desired.ports.clone();
                }
            }
            (UnitObject::PlacementGroup(observed), UnitObject::PlacementGroup(desired)) => {
                observed.spec = desired.spec.clone();
            }
            (UnitObject::Pod(observed), UnitObject::Pod(desired)) => {
                if let (Some(observed), Some(desired)) = (observed.spec.as_mut(), desired.spec.as_ref()) {
                    for container in observed.containers.iter_mut() {
                        if let Some(wanted) = desired.containers.iter().find(|c| c.name == container.name) {
                            container.resources = wanted.resources.clone();
                        }
                    }
                }
            }
            _ => {}
        }

        state.calls.push(GatewayCall::UpdateUnit(unit.key.clone()));
        Ok(())
    }

    async fn delete_unit(&self, namespace: &str, unit: &UnitKey) -> Result<()> {
        let mut state = self.state();
        state.check_fault(GatewayOp::DeleteUnit, &unit.name)?;
        let slot = (namespace.to_string(), unit.clone());
        let graceful = state.graceful_deletion;
        let stored = state
            .units
            .get_mut(&slot)
            .ok_or_else(|| Error::NotFound(unit.to_string()))?;
        if graceful {
            stored
                .object
                .metadata_mut()
                .deletion_timestamp
                .get_or_insert_with(|| Time(Timestamp::now()));
        } else {
            state.units.remove(&slot);
        }
        state.calls.push(GatewayCall::DeleteUnit(unit.clone()));
        Ok(())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<RayCluster>> {
        let mut state = self.state();
        state.check_fault(GatewayOp::GetCluster, name)?;
        Ok(state.clusters.get(&key(namespace, name)).cloned())
    }

    async fn list_owned_clusters(&self, owner: &OwnerIdentity) -> Result<Vec<RayCluster>> {
        let state = self.state();
        Ok(state
            .clusters
            .iter()
            .filter(|((ns, _), _)| ns == &owner.namespace)
            .filter(|(_, c)| c.owner_references().iter().any(|r| r.uid == owner.uid))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn create_cluster(&self, cluster: &RayCluster) -> Result<()> {
        let mut state = self.state();
        let name = cluster.name_any();
        state.check_fault(GatewayOp::CreateCluster, &name)?;
        let k = key(&namespace_or_default(&cluster.metadata), &name);
        if state.clusters.contains_key(&k) {
            return Err(Error::AlreadyExists(format!("RayCluster/{name}")));
        }
        let mut cluster = cluster.clone();
        state.admit(&mut cluster.metadata);
        state.clusters.insert(k, cluster);
        state.calls.push(GatewayCall::CreateCluster(name));
        Ok(())
    }

    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.check_fault(GatewayOp::DeleteCluster, name)?;
        let k = key(namespace, name);
        if !state.clusters.contains_key(&k) {
            return Err(Error::NotFound(format!("RayCluster/{name}")));
        }
        state.request_cluster_deletion(&k);
        state.calls.push(GatewayCall::DeleteCluster(name.to_string()));
        Ok(())
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &RayClusterStatus,
    ) -> Result<()> {
        let mut state = self.state();
        state.check_fault(GatewayOp::PatchClusterStatus, name)?;
        let n = state.next();
        let cluster = state
            .clusters
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound(format!("RayCluster/{name}")))?;
        if resource_version.is_some() && resource_version != cluster.metadata.resource_version.as_deref() {
            return Err(Error::Conflict(format!("RayCluster/{name}")));
        }
        cluster.status = Some(status.clone());
        cluster.metadata.resource_version = Some(n.to_string());
        state.calls.push(GatewayCall::PatchClusterStatus(name.to_string()));
        Ok(())
    }

    async fn set_cluster_finalizer(&self, namespace: &str, name: &str, present: bool) -> Result<()> {
        let mut state = self.state();
        let k = key(namespace, name);
        let n = state.next();
        let cluster = state
            .clusters
            .get_mut(&k)
            .ok_or_else(|| Error::NotFound(format!("RayCluster/{name}")))?;
        let finalizers = cluster.metadata.finalizers.get_or_insert_with(Vec::new);
        let has = finalizers.iter().any(|f| f == CLUSTER_FINALIZER);
        if present && !has {
            finalizers.push(CLUSTER_FINALIZER.to_string());
        } else if !present && has {
            finalizers.retain(|f| f != CLUSTER_FINALIZER);
        } else {
            return Ok(());
        }
        cluster.metadata.resource_version = Some(n.to_string());

        let release = cluster.metadata.deletion_timestamp.is_some()
            && cluster.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        if release {
            state.clusters.remove(&k);
            state.collect_garbage();
        }
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<RayService>> {
        Ok(self.state().services.get(&key(namespace, name)).cloned())
    }

    async fn patch_service_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &RayServiceStatus,
    ) -> Result<()> {
        let mut state = self.state();
        state.check_fault(GatewayOp::PatchServiceStatus, name)?;
        let n = state.next();
        let service = state
            .services
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound(format!("RayService/{name}")))?;
        if resource_version.is_some() && resource_version != service.metadata.resource_version.as_deref() {
            return Err(Error::Conflict(format!("RayService/{name}")));
        }
        service.status = Some(status.clone());
        service.metadata.resource_version = Some(n.to_string());
        state.calls.push(GatewayCall::PatchServiceStatus(name.to_string()));
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<RayJob>> {
        Ok(self.state().jobs.get(&key(namespace, name)).cloned())
    }

    async fn patch_job_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &RayJobStatus,
    ) -> Result<()> {
        let mut state = self.state();
        state.check_fault(GatewayOp::PatchJobStatus, name)?;
        let n = state.next();
        let job = state
            .jobs
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::NotFound(format!("RayJob/{name}")))?;
        if resource_version.is_some() && resource_version != job.metadata.resource_version.as_deref() {
            return Err(Error::Conflict(format!("RayJob/{name}")));
        }
        job.status = Some(status.clone());
        job.metadata.resource_version = Some(n.to_string());
        state.calls.push(GatewayCall::PatchJobStatus(name.to_string()));
        Ok(())
    }

    async fn list_keys(&self, kind: OwnerKind) -> Result<Vec<ObjectKey>> {
        let state = self.state();
        let keys: Vec<&Key> = match kind {
            OwnerKind::RayCluster => state.clusters.keys().collect(),
            OwnerKind::RayService => state.services.keys().collect(),
            OwnerKind::RayJob => state.jobs.keys().collect(),
        };
        Ok(keys
            .into_iter()
            .map(|(ns, name)| ObjectKey::new(kind, ns.clone(), name.clone()))
            .collect())
    }

    async fn record_event(&self, event: EventRecord) {
        self.state().events.push(event);
    }
}
