//! RayCluster reconciler.
//!
//! One pass: resolve the desired units, collect the observed ones, plan the
//! difference, execute the plan and write a status derived from what this pass
//! saw. Deletion sweeps the owned units before the finalizer is released.

use std::time::Instant;

use jiff::Timestamp;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::apply::execute;
use crate::controller::cluster_state_machine::{
    ClusterEvent, ClusterStateMachine, TransitionContext, TransitionResult,
};
use crate::controller::cluster_status::{StatusInputs, StatusUpdate, derive_status, invalid_spec_status};
use crate::controller::collector::collect;
use crate::controller::context::Context;
use crate::controller::diff::{PlanPolicy, plan};
use crate::controller::error::{Error, ErrorKind, Result};
use crate::controller::status::is_condition_true;
use crate::crd::{ClusterPhase, ConditionType, RayCluster, RayClusterStatus};
use crate::gateway::{ApiGateway, CLUSTER_FINALIZER};
use crate::resources::resolver::spec_fingerprint;
use crate::resources::{OwnerIdentity, resolve};
use crate::scheduler::{ObjectKey, ReconcileOutcome};
use crate::submission::JobSubmissionClient;

/// Attempts at writing a status before the pass gives up on it.
const STATUS_WRITE_ATTEMPTS: usize = 3;

/// Reconcile the RayCluster behind `key`.
pub async fn reconcile<G: ApiGateway, S: JobSubmissionClient>(
    key: &ObjectKey,
    ctx: &Context<G, S>,
) -> ReconcileOutcome {
    let start_time = Instant::now();
    debug!(name = %key.name, namespace = %key.namespace, "Reconciling RayCluster");

    let outcome = match reconcile_cluster(key, ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if e.is_not_found() {
                debug!(name = %key.name, error = %e, "RayCluster vanished mid-pass");
            } else {
                warn!(name = %key.name, namespace = %key.namespace, error = %e, "RayCluster reconcile failed");
                ctx.record_error(key);
            }
            ReconcileOutcome::from(&e)
        }
    };

    ctx.record_reconcile(key, start_time.elapsed().as_secs_f64());
    outcome
}

async fn reconcile_cluster<G: ApiGateway, S: JobSubmissionClient>(
    key: &ObjectKey,
    ctx: &Context<G, S>,
) -> Result<ReconcileOutcome> {
    let gateway = ctx.gateway.as_ref();
    let Some(cluster) = gateway.get_cluster(&key.namespace, &key.name).await? else {
        debug!(name = %key.name, "RayCluster not found, nothing to do");
        return Ok(ReconcileOutcome::Done);
    };
    let owner = OwnerIdentity::of_cluster(&cluster)?;

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &owner, ctx).await;
    }

    let cluster = if cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
        cluster
    } else {
        gateway
            .set_cluster_finalizer(&key.namespace, &key.name, true)
            .await?;
        match gateway.get_cluster(&key.namespace, &key.name).await? {
            Some(cluster) => cluster,
            None => return Ok(ReconcileOutcome::Done),
        }
    };

    let previous = cluster.status.clone().unwrap_or_default();
    let fingerprint = spec_fingerprint(&cluster.spec)?;
    if previous.phase == ClusterPhase::Failed
        && previous.last_applied_fingerprint.as_deref() == Some(fingerprint.as_str())
    {
        debug!(name = %key.name, "RayCluster failed and spec unchanged, not retrying");
        return Ok(ReconcileOutcome::Done);
    }

    let desired = match resolve(&cluster, &ctx.registry, &ctx.config) {
        Ok(desired) => desired,
        Err(e) if e.is_configuration() => {
            warn!(name = %key.name, namespace = %key.namespace, error = %e, "RayCluster spec rejected");
            let already_reported = !is_condition_true(&previous.conditions, ConditionType::SpecValid.as_str())
                && previous.last_error.as_deref() == Some(e.to_string().as_str())
                && previous.observed_generation == cluster.metadata.generation;
            if !already_reported {
                ctx.publish_warning_event(&owner, e.reason(), "Resolving", Some(e.to_string()))
                    .await;
                let status = invalid_spec_status(&cluster, &e, Timestamp::now());
                write_status(gateway, &cluster, &status).await?;
            }
            return Ok(ReconcileOutcome::Error(ErrorKind::Configuration));
        }
        Err(e) => return Err(e),
    };

    let observed = collect(gateway, &owner).await?;
    let mutation_plan = plan(&desired, &observed, &PlanPolicy::from_config(&ctx.config));
    if !mutation_plan.is_empty() || !mutation_plan.deferred.is_empty() {
        info!(
            name = %key.name,
            namespace = %key.namespace,
            creates = mutation_plan.count("create"),
            updates = mutation_plan.count("update"),
            deletes = mutation_plan.count("delete"),
            deferred = mutation_plan.deferred.len(),
            "Applying mutation plan"
        );
    }

    let report = execute(gateway, &owner.namespace, &mutation_plan).await;
    for action in ["create", "update", "delete"] {
        ctx.record_mutations(action, report.applied_count(action));
    }

    let update = derive_status(&StatusInputs {
        cluster: &cluster,
        observed: &observed,
        plan: &mutation_plan,
        report: &report,
        fingerprint: &fingerprint,
        config: &ctx.config,
        now: Timestamp::now(),
    });
    log_transition(key, &update);

    write_status(gateway, &cluster, &update.status).await?;
    publish_status_events(ctx, &owner, &previous, &update).await;
    ctx.set_worker_replicas(
        key,
        update.status.desired_worker_replicas,
        update.status.ready_worker_replicas,
    );

    if !report.is_clean() && update.status.phase != ClusterPhase::Failed {
        return Ok(ReconcileOutcome::Error(ErrorKind::PartialPlan));
    }
    Ok(match update.status.phase {
        ClusterPhase::Running | ClusterPhase::Failed | ClusterPhase::Deleting => ReconcileOutcome::Done,
        _ => ReconcileOutcome::RetryAfter(ctx.config.pending_requeue),
    })
}

fn log_transition(key: &ObjectKey, update: &StatusUpdate) {
    match &update.transition {
        TransitionResult::Success { from, to, event, .. } if from != to => {
            info!(name = %key.name, namespace = %key.namespace, %from, %to, %event, "Phase transition");
        }
        TransitionResult::Success { .. } => {}
        TransitionResult::InvalidTransition { current, event } => {
            warn!(name = %key.name, %current, %event, "Rejected phase transition");
        }
        TransitionResult::GuardFailed { from, event, reason, .. } => {
            debug!(name = %key.name, %from, %event, %reason, "Transition guard failed");
        }
    }
}

async fn publish_status_events<G: ApiGateway, S: JobSubmissionClient>(
    ctx: &Context<G, S>,
    owner: &OwnerIdentity,
    previous: &RayClusterStatus,
    update: &StatusUpdate,
) {
    let status = &update.status;
    if update.phase_changed() {
        let note = Some(format!("{} -> {}", previous.phase, status.phase));
        match status.phase {
            ClusterPhase::Failed => {
                let note = status.last_error.clone().or(note);
                ctx.publish_warning_event(owner, "ConvergenceFailed", "Reconciling", note)
                    .await;
            }
            ClusterPhase::Degraded => {
                ctx.publish_warning_event(owner, "Degraded", "Reconciling", note).await;
            }
            phase => {
                ctx.publish_normal_event(owner, &phase.to_string(), "Reconciling", note)
                    .await;
            }
        }
    }

    let blocked = ConditionType::UpgradeBlocked.as_str();
    if is_condition_true(&status.conditions, blocked) && !is_condition_true(&previous.conditions, blocked) {
        let reason = status
            .conditions
            .iter()
            .find(|c| c.r#type == blocked)
            .map(|c| c.reason.clone())
            .unwrap_or_default();
        ctx.publish_warning_event(owner, &reason, "Upgrading", None).await;
    }
}

/// Sweep owned units, then release the finalizer.
async fn handle_deletion<G: ApiGateway, S: JobSubmissionClient>(
    cluster: &RayCluster,
    owner: &OwnerIdentity,
    ctx: &Context<G, S>,
) -> Result<ReconcileOutcome> {
    let gateway = ctx.gateway.as_ref();
    info!(name = %owner.name, namespace = %owner.namespace, "Deleting RayCluster");

    let previous = cluster.status.clone().unwrap_or_default();
    let transition_ctx = TransitionContext {
        deleting: true,
        ..Default::default()
    };
    let phase = ClusterStateMachine::new()
        .transition(previous.phase, ClusterEvent::DeletionRequested, &transition_ctx)
        .phase(previous.phase);
    if phase != previous.phase {
        let status = RayClusterStatus {
            phase,
            last_update_time: Some(Timestamp::now().to_string()),
            ..previous
        };
        // Best effort: the object is going away.
        if let Err(e) = write_status(gateway, cluster, &status).await {
            debug!(name = %owner.name, error = %e, "Could not record Deleting phase");
        }
    }

    let observed = collect(gateway, owner).await?;
    let mut failures = 0usize;
    for unit in observed.iter().filter(|o| !o.is_terminating()) {
        match gateway.delete_unit(&owner.namespace, &unit.key).await {
            Ok(()) => debug!(unit = %unit.key, "Deleted unit"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(unit = %unit.key, error = %e, "Failed to delete unit");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        return Err(Error::Transient(format!(
            "{failures} units of {} could not be deleted",
            owner.name
        )));
    }

    gateway
        .set_cluster_finalizer(&owner.namespace, &owner.name, false)
        .await?;
    info!(name = %owner.name, "RayCluster units swept, finalizer released");
    Ok(ReconcileOutcome::Done)
}

/// Write a status guarded by the cluster's resourceVersion.
///
/// On a conflict the version is refreshed and the same status written again.
async fn write_status<G: ApiGateway>(
    gateway: &G,
    cluster: &RayCluster,
    status: &RayClusterStatus,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let mut resource_version = cluster.resource_version();

    for attempt in 1..=STATUS_WRITE_ATTEMPTS {
        match gateway
            .patch_cluster_status(&namespace, &name, resource_version.as_deref(), status)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() && attempt < STATUS_WRITE_ATTEMPTS => {
                debug!(name = %name, attempt, "Status write conflicted, refreshing resourceVersion");
                resource_version = gateway
                    .get_cluster(&namespace, &name)
                    .await?
                    .and_then(|c| c.resource_version());
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(format!("status of RayCluster/{name}")))
}
