//! Kubernetes implementation of the API gateway.

use k8s_openapi::api::core::v1::{ObjectReference, Pod, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::controller::common::{FIELD_MANAGER, add_finalizer, remove_finalizer};
use crate::controller::error::Result;
use crate::crd::{RayCluster, RayClusterStatus, RayJob, RayJobStatus, RayService, RayServiceStatus};
use crate::resources::common::RAY_API_VERSION;
use crate::resources::units::{
    DesiredUnit, OwnerIdentity, OwnerKind, PlacementGroup, UnitKey, UnitKind, UnitObject,
};
use crate::scheduler::ObjectKey;

use super::{ApiGateway, CLUSTER_FINALIZER, EventRecord, EventSeverity};

/// Gateway backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    reporter: Reporter,
    /// Namespaces listed by the resync sweep; `None` lists cluster-wide.
    namespaces: Option<Vec<String>>,
    /// API resource of the gang-scheduling placement group, when enabled.
    placement: Option<ApiResource>,
    in_place_resize: bool,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            namespaces: None,
            placement: None,
            in_place_resize: false,
        }
    }

    pub fn with_namespaces(mut self, namespaces: Option<Vec<String>>) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn with_placement_resource(mut self, resource: ApiResource) -> Self {
        self.placement = Some(resource);
        self
    }

    pub fn with_in_place_resize(mut self, enabled: bool) -> Self {
        self.in_place_resize = enabled;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn placement_api(&self, namespace: &str) -> Option<Api<DynamicObject>> {
        self.placement
            .as_ref()
            .map(|ar| Api::namespaced_with(self.client.clone(), namespace, ar))
    }

    async fn list_all<K>(&self, kind: OwnerKind) -> Result<Vec<ObjectKey>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let apis: Vec<Api<K>> = match &self.namespaces {
            Some(namespaces) => namespaces.iter().map(|ns| self.api(ns)).collect(),
            None => vec![Api::all(self.client.clone())],
        };
        let mut keys = Vec::new();
        for api in apis {
            for item in api.list(&ListParams::default()).await?.items {
                keys.push(ObjectKey::new(
                    kind,
                    item.namespace().unwrap_or_default(),
                    item.name_any(),
                ));
            }
        }
        Ok(keys)
    }

    async fn patch_status_of<K>(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: serde_json::Value,
    ) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        let mut patch = serde_json::json!({ "status": status });
        if let Some(rv) = resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Merge patch carrying the mutable metadata of a unit and its version guard.
fn metadata_patch(unit: &DesiredUnit, resource_version: Option<&str>) -> serde_json::Value {
    let meta = unit.object.metadata();
    let mut metadata = serde_json::json!({
        "labels": meta.labels,
        "annotations": meta.annotations,
    });
    if let Some(rv) = resource_version {
        metadata["resourceVersion"] = serde_json::json!(rv);
    }
    serde_json::json!({ "metadata": metadata })
}

/// One write of an in-place Pod update.
#[derive(Debug, Clone, PartialEq)]
enum PodPatch {
    /// Strategic merge patch of the `resize` subresource.
    Resize(serde_json::Value),
    /// Merge patch of labels and annotations.
    Metadata(serde_json::Value),
}

/// Writes of an in-place Pod update, in the order they are sent.
///
/// The metadata patch carries the new mutable hash and is sent last, so a
/// failed resize leaves the old hash behind and the update is planned again.
/// The resourceVersion precondition rides on the first write.
fn pod_patches(
    unit: &DesiredUnit,
    pod: &Pod,
    resource_version: Option<&str>,
    in_place_resize: bool,
) -> Vec<PodPatch> {
    if !in_place_resize {
        return vec![PodPatch::Metadata(metadata_patch(unit, resource_version))];
    }
    let containers: Vec<_> = pod
        .spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .map(|c| serde_json::json!({ "name": c.name, "resources": c.resources }))
        .collect();
    let mut resize = serde_json::json!({ "spec": { "containers": containers } });
    if let Some(rv) = resource_version {
        resize["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    vec![
        PodPatch::Resize(resize),
        PodPatch::Metadata(metadata_patch(unit, None)),
    ]
}

impl ApiGateway for KubeGateway {
    #[instrument(skip(self, owner), fields(owner = %owner.name, kind = %owner.kind))]
    async fn list_units(&self, owner: &OwnerIdentity) -> Result<Vec<UnitObject>> {
        let params = ListParams::default().labels(&owner.label_selector());

        let mut units: Vec<UnitObject> = Vec::new();
        let pods: Api<Pod> = self.api(&owner.namespace);
        units.extend(
            pods.list(&params)
                .await?
                .items
                .into_iter()
                .map(|p| UnitObject::Pod(Box::new(p))),
        );
        let services: Api<Service> = self.api(&owner.namespace);
        units.extend(
            services
                .list(&params)
                .await?
                .items
                .into_iter()
                .map(|s| UnitObject::Service(Box::new(s))),
        );

        if owner.kind == OwnerKind::RayCluster
            && let Some(api) = self.placement_api(&owner.namespace)
        {
            match api.list(&params).await {
                Ok(list) => {
                    for item in list.items {
                        let group: PlacementGroup =
                            serde_json::from_value(serde_json::to_value(&item)?)?;
                        units.push(UnitObject::PlacementGroup(Box::new(group)));
                    }
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    debug!("Placement group resource not installed");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(units)
    }

    #[instrument(skip(self, unit), fields(unit = %unit.key))]
    async fn create_unit(&self, namespace: &str, unit: &DesiredUnit) -> Result<()> {
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match &unit.object {
            UnitObject::Pod(pod) => {
                self.api::<Pod>(namespace).create(&pp, pod).await?;
            }
            UnitObject::Service(service) => {
                self.api::<Service>(namespace).create(&pp, service).await?;
            }
            UnitObject::PlacementGroup(group) => {
                let Some(api) = self.placement_api(namespace) else {
                    return Err(crate::controller::error::Error::Validation(format!(
                        "placement group {} requires the batch scheduler to be enabled",
                        unit.key.name
                    )));
                };
                let object: DynamicObject = serde_json::from_value(serde_json::to_value(group)?)?;
                api.create(&pp, &object).await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self, unit, resource_version), fields(unit = %unit.key))]
    async fn update_unit(
        &self,
        namespace: &str,
        unit: &DesiredUnit,
        resource_version: Option<&str>,
    ) -> Result<()> {
        let pp = PatchParams::default();
        let mut patch = metadata_patch(unit, resource_version);
        let name = unit.key.name.as_str();

        match &unit.object {
            UnitObject::Pod(pod) => {
                let api = self.api::<Pod>(namespace);
                for step in pod_patches(unit, pod, resource_version, self.in_place_resize) {
                    match step {
                        PodPatch::Resize(body) => {
                            api.patch_subresource("resize", name, &pp, &Patch::Strategic(&body))
                                .await?;
                        }
                        PodPatch::Metadata(body) => {
                            api.patch(name, &pp, &Patch::Merge(&body)).await?;
                        }
                    }
                }
            }
            UnitObject::Service(service) => {
                if let Some(spec) = &service.spec {
                    patch["spec"] = serde_json::json!({
                        "selector": spec.selector,
                        "ports": spec.ports,
                    });
                }
                self.api::<Service>(namespace)
                    .patch(name, &pp, &Patch::Merge(&patch))
                    .await?;
            }
            UnitObject::PlacementGroup(group) => {
                patch["spec"] = group.spec.clone();
                if let Some(api) = self.placement_api(namespace) {
                    api.patch(name, &pp, &Patch::Merge(&patch)).await?;
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self, key), fields(unit = %key))]
    async fn delete_unit(&self, namespace: &str, key: &UnitKey) -> Result<()> {
        let dp = DeleteParams::background();
        match key.kind {
            UnitKind::Pod => {
                self.api::<Pod>(namespace).delete(&key.name, &dp).await?;
            }
            UnitKind::Service => {
                self.api::<Service>(namespace).delete(&key.name, &dp).await?;
            }
            UnitKind::PlacementGroup => {
                if let Some(api) = self.placement_api(namespace) {
                    api.delete(&key.name, &dp).await?;
                }
            }
        }
        Ok(())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<RayCluster>> {
        Ok(self.api::<RayCluster>(namespace).get_opt(name).await?)
    }

    async fn list_owned_clusters(&self, owner: &OwnerIdentity) -> Result<Vec<RayCluster>> {
        let params = ListParams::default().labels(&owner.label_selector());
        let clusters = self
            .api::<RayCluster>(&owner.namespace)
            .list(&params)
            .await?
            .items
            .into_iter()
            .filter(|c| c.owner_references().iter().any(|r| r.uid == owner.uid))
            .collect();
        Ok(clusters)
    }

    async fn create_cluster(&self, cluster: &RayCluster) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api::<RayCluster>(&namespace).create(&pp, cluster).await?;
        Ok(())
    }

    async fn delete_cluster(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<RayCluster>(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &RayClusterStatus,
    ) -> Result<()> {
        self.patch_status_of::<RayCluster>(
            namespace,
            name,
            resource_version,
            serde_json::to_value(status)?,
        )
        .await
    }

    async fn set_cluster_finalizer(&self, namespace: &str, name: &str, present: bool) -> Result<()> {
        let api = self.api::<RayCluster>(namespace);
        if present {
            add_finalizer(&api, name, CLUSTER_FINALIZER).await
        } else {
            remove_finalizer(&api, name, CLUSTER_FINALIZER).await
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<RayService>> {
        Ok(self.api::<RayService>(namespace).get_opt(name).await?)
    }

    async fn patch_service_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &RayServiceStatus,
    ) -> Result<()> {
        self.patch_status_of::<RayService>(
            namespace,
            name,
            resource_version,
            serde_json::to_value(status)?,
        )
        .await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<RayJob>> {
        Ok(self.api::<RayJob>(namespace).get_opt(name).await?)
    }

    async fn patch_job_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &RayJobStatus,
    ) -> Result<()> {
        self.patch_status_of::<RayJob>(
            namespace,
            name,
            resource_version,
            serde_json::to_value(status)?,
        )
        .await
    }

    async fn list_keys(&self, kind: OwnerKind) -> Result<Vec<ObjectKey>> {
        match kind {
            OwnerKind::RayCluster => self.list_all::<RayCluster>(kind).await,
            OwnerKind::RayService => self.list_all::<RayService>(kind).await,
            OwnerKind::RayJob => self.list_all::<RayJob>(kind).await,
        }
    }

    async fn record_event(&self, event: EventRecord) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let object_ref = ObjectReference {
            api_version: Some(RAY_API_VERSION.to_string()),
            kind: Some(event.kind.as_str().to_string()),
            name: Some(event.name.clone()),
            namespace: Some(event.namespace.clone()),
            uid: event.uid.clone(),
            ..Default::default()
        };
        let type_ = match event.severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: event.note.clone(),
                    action: event.action.clone(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            warn!(reason = %event.reason, error = %e, "Failed to publish event");
        }
    }
}
