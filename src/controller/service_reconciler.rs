//! RayService reconciler.
//!
//! Executes a [`ServicePlan`]: new clusters first, then the serve endpoint,
//! then deletions. The status is written only after the endpoint write
//! succeeded, so a failed swap leaves the old cluster serving and recorded.

use std::time::{Duration, Instant};

use jiff::Timestamp;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::cluster_validation::validate_cluster_spec;
use crate::controller::context::Context;
use crate::controller::error::{Error, ErrorKind, Result};
use crate::controller::service_plan::{ServicePlan, ServicePlanInputs, next_expiry, plan, service_cluster_name};
use crate::controller::status::ConditionBuilder;
use crate::crd::{RayService, RayServiceStatus, ServicePhase};
use crate::gateway::ApiGateway;
use crate::resources::common::{ANNOTATION_MUTABLE_HASH, serve_service_name};
use crate::resources::resolver::{finish_unit, spec_fingerprint};
use crate::resources::services::{selected_cluster, serve_service};
use crate::resources::{OwnerIdentity, UnitKey, UnitObject, UnitRole};
use crate::scheduler::{ObjectKey, ReconcileOutcome};
use crate::submission::JobSubmissionClient;

const STATUS_WRITE_ATTEMPTS: usize = 3;

/// Reconcile the RayService behind `key`.
pub async fn reconcile<G: ApiGateway, S: JobSubmissionClient>(
    key: &ObjectKey,
    ctx: &Context<G, S>,
) -> ReconcileOutcome {
    let start_time = Instant::now();
    debug!(name = %key.name, namespace = %key.namespace, "Reconciling RayService");

    let outcome = match reconcile_service(key, ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(name = %key.name, namespace = %key.namespace, error = %e, "RayService reconcile failed");
            ctx.record_error(key);
            ReconcileOutcome::from(&e)
        }
    };

    ctx.record_reconcile(key, start_time.elapsed().as_secs_f64());
    outcome
}

async fn reconcile_service<G: ApiGateway, S: JobSubmissionClient>(
    key: &ObjectKey,
    ctx: &Context<G, S>,
) -> Result<ReconcileOutcome> {
    let gateway = ctx.gateway.as_ref();
    let Some(service) = gateway.get_service(&key.namespace, &key.name).await? else {
        debug!(name = %key.name, "RayService not found, nothing to do");
        return Ok(ReconcileOutcome::Done);
    };
    if service.metadata.deletion_timestamp.is_some() {
        // Owned clusters and the serve endpoint are garbage-collected.
        return Ok(ReconcileOutcome::Done);
    }
    let owner = OwnerIdentity::of_service(&service)?;

    let fingerprint = spec_fingerprint(&service.spec.ray_cluster_config)?;
    let cluster_name = service_cluster_name(&owner.name, &fingerprint);
    if let Err(e) = validate_cluster_spec(&cluster_name, &service.spec.ray_cluster_config) {
        warn!(name = %key.name, cluster = %cluster_name, error = %e, "RayService cluster config rejected");
        let status = invalid_config_status(&service, &e);
        if service.status.as_ref().map(|s| &s.conditions) != Some(&status.conditions) {
            ctx.publish_warning_event(&owner, e.reason(), "Validating", Some(e.to_string()))
                .await;
            write_status(gateway, &service, &status).await?;
        }
        return Ok(ReconcileOutcome::Error(ErrorKind::Configuration));
    }

    let owned_clusters = gateway.list_owned_clusters(&owner).await?;
    let serve_unit = observed_serve_unit(gateway, &owner).await?;
    let serving = serve_unit.as_ref().and_then(|unit| match unit {
        UnitObject::Service(svc) => selected_cluster(svc).map(str::to_string),
        _ => None,
    });

    let now = Timestamp::now();
    let retention = service
        .spec
        .cluster_retention_seconds
        .map(|secs| Duration::from_secs(u64::try_from(secs).unwrap_or(0)))
        .unwrap_or(ctx.config.service_cluster_retention);
    let service_plan = plan(&ServicePlanInputs {
        service: &service,
        owner: &owner,
        fingerprint: &fingerprint,
        owned_clusters: &owned_clusters,
        retention,
        now,
    });

    for cluster in &service_plan.create {
        let name = cluster.name_any();
        match gateway.create_cluster(cluster).await {
            Ok(()) => {
                info!(service = %owner.name, cluster = %name, "Created RayCluster for RayService");
                ctx.publish_normal_event(&owner, "ClusterCreated", "Creating", Some(name)).await;
            }
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
    }

    if let Some(target) = &service_plan.serve_target {
        if let Err(e) = ensure_serve_endpoint(gateway, &owner, &service, target, serve_unit.as_ref()).await {
            warn!(service = %owner.name, target = %target, error = %e, "Serve endpoint write failed, keeping current target");
            return Err(e);
        }
    }
    if let Some(promoted) = &service_plan.promoted {
        info!(service = %owner.name, cluster = %promoted, previous = ?serving, "Promoted RayCluster");
        ctx.publish_normal_event(&owner, "Promoted", "Swapping", Some(promoted.clone()))
            .await;
    }

    let mut failed_deletes = 0usize;
    for name in &service_plan.delete {
        match gateway.delete_cluster(&owner.namespace, name).await {
            Ok(()) => info!(service = %owner.name, cluster = %name, "Deleted RayCluster"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(service = %owner.name, cluster = %name, error = %e, "Failed to delete RayCluster");
                failed_deletes += 1;
            }
        }
    }

    if service.status.as_ref() != Some(&without_time(&service_plan, &service)) {
        write_status(gateway, &service, &service_plan.status).await?;
    }

    if failed_deletes > 0 {
        return Ok(ReconcileOutcome::Error(ErrorKind::Transient));
    }
    Ok(requeue(&service_plan, now, ctx.config.pending_requeue))
}

/// Status of a service whose cluster config was rejected: the previous
/// status with `SpecValid` set to false.
fn invalid_config_status(service: &RayService, error: &Error) -> RayServiceStatus {
    let previous = service.status.clone().unwrap_or_default();
    let generation = service.metadata.generation;
    let mut conditions = ConditionBuilder::from_existing(&previous.conditions);
    conditions.spec_valid(false, error.reason(), &error.to_string(), generation);
    RayServiceStatus {
        conditions: conditions.build(),
        observed_generation: generation,
        last_update_time: Some(Timestamp::now().to_string()),
        ..previous
    }
}

/// The planned status with the previous update time, for change detection.
fn without_time(service_plan: &ServicePlan, service: &RayService) -> RayServiceStatus {
    RayServiceStatus {
        last_update_time: service.status.as_ref().and_then(|s| s.last_update_time.clone()),
        ..service_plan.status.clone()
    }
}

fn requeue(service_plan: &ServicePlan, now: Timestamp, pending_requeue: Duration) -> ReconcileOutcome {
    match service_plan.status.service_status {
        ServicePhase::Running => ReconcileOutcome::Done,
        ServicePhase::Swapping => {
            let delay = next_expiry(&service_plan.status, now).unwrap_or(pending_requeue);
            ReconcileOutcome::RetryAfter(delay.max(Duration::from_secs(1)))
        }
        ServicePhase::Pending | ServicePhase::WaitingForTarget => ReconcileOutcome::RetryAfter(pending_requeue),
    }
}

async fn observed_serve_unit<G: ApiGateway>(gateway: &G, owner: &OwnerIdentity) -> Result<Option<UnitObject>> {
    let name = serve_service_name(&owner.name);
    Ok(gateway
        .list_units(owner)
        .await?
        .into_iter()
        .find(|u| u.is_owned_by(&owner.uid) && u.key() == UnitKey::service(name.as_str())))
}

/// Point the serve endpoint at `target`, creating it when missing.
async fn ensure_serve_endpoint<G: ApiGateway>(
    gateway: &G,
    owner: &OwnerIdentity,
    service: &RayService,
    target: &str,
    observed: Option<&UnitObject>,
) -> Result<()> {
    let object = UnitObject::Service(Box::new(serve_service(
        &owner.name,
        target,
        &service.spec.serve_service,
    )));
    let unit = finish_unit(owner, UnitRole::Serve, object, false, None)?;
    match observed {
        Some(current) if current.annotation(ANNOTATION_MUTABLE_HASH) == Some(unit.mutable_hash.as_str()) => Ok(()),
        Some(current) => {
            let resource_version = current.metadata().resource_version.clone();
            gateway
                .update_unit(&owner.namespace, &unit, resource_version.as_deref())
                .await?;
            info!(service = %owner.name, target = %target, "Serve endpoint repointed");
            Ok(())
        }
        None => match gateway.create_unit(&owner.namespace, &unit).await {
            Ok(()) => {
                info!(service = %owner.name, target = %target, "Serve endpoint created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Err(Error::Conflict(format!(
                "serve endpoint {} appeared concurrently",
                unit.key
            ))),
            Err(e) => Err(e),
        },
    }
}

async fn write_status<G: ApiGateway>(gateway: &G, service: &RayService, status: &RayServiceStatus) -> Result<()> {
    let namespace = service.namespace().unwrap_or_default();
    let name = service.name_any();
    let mut resource_version = service.resource_version();

    for attempt in 1..=STATUS_WRITE_ATTEMPTS {
        match gateway
            .patch_service_status(&namespace, &name, resource_version.as_deref(), status)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() && attempt < STATUS_WRITE_ATTEMPTS => {
                debug!(name = %name, attempt, "Status write conflicted, refreshing resourceVersion");
                resource_version = gateway
                    .get_service(&namespace, &name)
                    .await?
                    .and_then(|s| s.resource_version());
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(format!("status of RayService/{name}")))
}
