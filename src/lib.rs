//! ray-operator library crate
//!
//! This module exports the CRD definitions, the reconcilers, the platform
//! gateway and the scheduler that drives them. [`run`] wires all of it to a
//! live Kubernetes cluster.

pub mod batch;
pub mod config;
pub mod controller;
pub mod crd;
pub mod gateway;
pub mod health;
pub mod resources;
pub mod scheduler;
pub mod submission;

pub use health::HealthState;

use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{WatchStreamExt, metadata_watcher, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use batch::SchedulerRegistry;
use batch::volcano::pod_group_resource;
use config::OperatorConfig;
use controller::Dispatcher;
use controller::context::Context;
use controller::error::Result;
use crd::{RayCluster, RayJob, RayService};
use gateway::KubeGateway;
use resources::common::{LABEL_MANAGED_BY, MANAGED_BY};
use resources::units::{OwnerKind, controller_owner};
use scheduler::{ObjectKey, WorkQueue};
use submission::DashboardClient;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Create the default watcher configuration for all watches.
///
/// `any_semantic()` gives more reliable resource discovery in test environments.
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Key of the resource controlling an object, if it is one of ours.
fn owner_key(meta: &ObjectMeta) -> Option<ObjectKey> {
    let (kind, name) = controller_owner(meta)?;
    let namespace = meta.namespace.clone().unwrap_or_else(|| "default".to_string());
    Some(ObjectKey::new(kind, namespace, name))
}

/// Keys to enqueue for a changed managed resource: itself and its controller.
fn resource_keys<K: Resource<DynamicType = ()>>(kind: OwnerKind, obj: &K) -> Vec<ObjectKey> {
    let meta = obj.meta();
    let own = ObjectKey::new(
        kind,
        meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
        obj.name_any(),
    );
    std::iter::once(own).chain(owner_key(meta)).collect()
}

fn watch_managed<K>(api: Api<K>, kind: OwnerKind) -> BoxStream<'static, Vec<ObjectKey>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    watcher(api, default_watcher_config())
        .default_backoff()
        .touched_objects()
        .filter_map(move |result| async move {
            match result {
                Ok(obj) => Some(resource_keys(kind, &obj)),
                Err(e) => {
                    warn!(%kind, error = %e, "Watch error");
                    None
                }
            }
        })
        .boxed()
}

/// Watch objects the operator created and map them to their controller.
///
/// Only metadata is needed, so the metadata watcher keeps memory and IO low.
fn watch_owned<K>(api: Api<K>) -> BoxStream<'static, Vec<ObjectKey>>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    let config = default_watcher_config().labels(&format!("{LABEL_MANAGED_BY}={MANAGED_BY}"));
    metadata_watcher(api, config)
        .default_backoff()
        .touched_objects()
        .filter_map(|result| async move {
            match result {
                Ok(obj) => owner_key(&obj.metadata).map(|key| vec![key]),
                Err(e) => {
                    warn!(error = %e, "Owned object watch error");
                    None
                }
            }
        })
        .boxed()
}

/// All watch streams for the given scopes, merged.
fn watch_streams(client: &Client, namespaces: Option<Vec<String>>) -> BoxStream<'static, Vec<ObjectKey>> {
    let scopes: Vec<Option<String>> = match namespaces {
        Some(namespaces) => namespaces.into_iter().map(Some).collect(),
        None => vec![None],
    };
    let mut streams = Vec::new();
    for scope in &scopes {
        let ns = scope.as_deref();
        streams.push(watch_managed(scoped_api::<RayCluster>(client.clone(), ns), OwnerKind::RayCluster));
        streams.push(watch_managed(scoped_api::<RayService>(client.clone(), ns), OwnerKind::RayService));
        streams.push(watch_managed(scoped_api::<RayJob>(client.clone(), ns), OwnerKind::RayJob));
        streams.push(watch_owned(scoped_api::<Pod>(client.clone(), ns)));
        streams.push(watch_owned(scoped_api::<Service>(client.clone(), ns)));
    }
    stream::select_all(streams).boxed()
}

/// Run the operator until the work queue shuts down.
///
/// Watch events and the periodic resync sweep feed one work queue, drained by
/// `reconcile_concurrency` workers. The health state is marked ready once the
/// watches are set up.
pub async fn run(client: Client, config: &OperatorConfig, health_state: Arc<HealthState>) -> Result<()> {
    let scope_msg = config
        .namespaces()
        .map(|ns| ns.join(","))
        .unwrap_or_else(|| "cluster-wide".to_string());
    info!(scope = %scope_msg, "Starting RayCluster, RayService and RayJob controllers");

    let registry = Arc::new(SchedulerRegistry::from_config(config.enable_batch_scheduler));
    info!(schedulers = ?registry.names(), "Batch scheduler registry ready");

    let mut gateway = KubeGateway::new(client.clone())
        .with_namespaces(config.namespaces())
        .with_in_place_resize(config.in_place_resize);
    if config.enable_batch_scheduler {
        gateway = gateway.with_placement_resource(pod_group_resource());
    }
    let gateway = Arc::new(gateway);

    let ctx = Context::new(
        gateway.clone(),
        registry,
        config.engine(),
        Arc::new(DashboardClient::new()?),
    )
    .with_health_state(health_state.clone());
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(ctx)));
    let queue = Arc::new(WorkQueue::new());

    let feeder = {
        let queue = queue.clone();
        let mut events = watch_streams(&client, config.namespaces());
        tokio::spawn(async move {
            while let Some(keys) = events.next().await {
                for key in keys {
                    debug!(key = %key, "Watch event");
                    queue.add(key);
                }
            }
            warn!("Watch streams ended");
        })
    };

    let scheduler_config = config.scheduler();
    let resync = tokio::spawn(scheduler::resync_loop(
        gateway,
        queue.clone(),
        scheduler_config.resync_interval,
    ));

    health_state.set_ready(true).await;
    scheduler::run_workers(dispatcher, queue, &scheduler_config, Some(health_state)).await;

    feeder.abort();
    resync.abort();
    info!("Controllers stopped");
    Ok(())
}
