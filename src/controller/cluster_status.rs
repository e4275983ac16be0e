//! RayCluster status derivation.
//!
//! The status is recomputed on every pass from the units observed in that
//! pass, the plan that was executed and the counters persisted in the
//! previous status. Phase changes go through the cluster state machine.

use jiff::Timestamp;
use kube::ResourceExt;

use crate::config::EngineConfig;
use crate::controller::apply::ApplyReport;
use crate::controller::cluster_state_machine::{
    ClusterEvent, ClusterStateMachine, TransitionContext, TransitionResult, determine_event,
};
use crate::controller::collector::ObservedUnit;
use crate::controller::diff::{DeferReason, MutationPlan};
use crate::controller::error::Error;
use crate::controller::status::ConditionBuilder;
use crate::crd::{ClusterPhase, HeadInfo, RayCluster, RayClusterStatus, WorkerGroupStatus};
use crate::resources::common::{head_pod_name, head_service_name};
use crate::resources::pods::head_ports;
use crate::resources::{UnitKind, UnitRole};

/// Everything a pass knows when it writes the status.
pub struct StatusInputs<'a> {
    pub cluster: &'a RayCluster,
    pub observed: &'a [ObservedUnit],
    pub plan: &'a MutationPlan,
    pub report: &'a ApplyReport,
    /// Fingerprint of the spec resolved in this pass.
    pub fingerprint: &'a str,
    pub config: &'a EngineConfig,
    pub now: Timestamp,
}

/// A derived status plus the transition that produced its phase.
#[derive(Debug)]
pub struct StatusUpdate {
    pub status: RayClusterStatus,
    pub event: ClusterEvent,
    pub transition: TransitionResult,
}

impl StatusUpdate {
    /// The phase moved to a different value.
    pub fn phase_changed(&self) -> bool {
        matches!(self.transition, TransitionResult::Success { from, to, .. } if from != to)
    }
}

/// Per-group desired, observed and ready worker counts.
pub fn worker_group_statuses(cluster: &RayCluster, observed: &[ObservedUnit]) -> Vec<WorkerGroupStatus> {
    cluster
        .spec
        .worker_group_specs
        .iter()
        .map(|group| {
            let members = observed.iter().filter(|o| {
                !o.is_terminating()
                    && matches!(&o.role, UnitRole::Worker { group: g } if *g == group.group_name)
            });
            let (observed_replicas, ready_replicas) =
                members.fold((0, 0), |(seen, ready), o| (seen + 1, ready + i32::from(o.is_ready())));
            WorkerGroupStatus {
                group_name: group.group_name.clone(),
                desired_replicas: group.replicas.max(0),
                observed_replicas,
                ready_replicas,
            }
        })
        .collect()
}

fn head_info(cluster: &RayCluster, observed: &[ObservedUnit]) -> HeadInfo {
    let name = cluster.name_any();
    let pod_name = head_pod_name(&name);
    let service_name = head_service_name(&name);
    let head_pod = observed
        .iter()
        .find(|o| o.key.kind == UnitKind::Pod && o.key.name == pod_name);
    let head_service = observed
        .iter()
        .find(|o| o.key.kind == UnitKind::Service && o.key.name == service_name);
    HeadInfo {
        pod_ip: head_pod.and_then(|o| o.pod_ip.clone()),
        pod_name: head_pod.map(|_| pod_name),
        service_ip: head_service.and_then(|o| o.cluster_ip.clone()),
        service_name: head_service.map(|_| service_name),
    }
}

/// Derive the status of a pass.
pub fn derive_status(inputs: &StatusInputs<'_>) -> StatusUpdate {
    let cluster = inputs.cluster;
    let previous = cluster.status.clone().unwrap_or_default();
    let generation = cluster.metadata.generation;

    let spec_changed = previous.last_applied_fingerprint.as_deref() != Some(inputs.fingerprint);
    let carried = if spec_changed {
        0
    } else {
        previous.consecutive_failures
    };
    // Retryable failures neither count nor reset.
    let consecutive_failures = if inputs.report.is_clean() {
        0
    } else if inputs.report.has_persistent_failure() {
        carried.saturating_add(1)
    } else {
        carried
    };
    let budget = i32::try_from(inputs.config.failure_budget).unwrap_or(i32::MAX);
    let restarts = i32::try_from(inputs.report.restarts()).unwrap_or(i32::MAX);

    let groups = worker_group_statuses(cluster, inputs.observed);
    let head_ready = inputs
        .observed
        .iter()
        .any(|o| o.role == UnitRole::Head && o.key.kind == UnitKind::Pod && o.is_ready());
    let unhealthy: Vec<&ObservedUnit> = inputs
        .observed
        .iter()
        .filter(|o| {
            o.unhealthy_for(inputs.now)
                .is_some_and(|d| d > inputs.config.unhealthy_grace_period)
        })
        .collect();

    let ctx = TransitionContext {
        deleting: cluster.metadata.deletion_timestamp.is_some(),
        budget_exhausted: budget > 0 && consecutive_failures >= budget,
        spec_changed,
        observed_units: inputs.observed.len(),
        head_ready,
        groups_ready: groups.iter().all(|g| g.ready_replicas == g.desired_replicas),
        unhealthy_units: unhealthy.len(),
        upgrading: inputs.plan.upgrading(),
    };
    let event = determine_event(previous.phase, &ctx);
    let transition = ClusterStateMachine::new().transition(previous.phase, event, &ctx);
    let phase = transition.phase(previous.phase);

    let mut conditions = ConditionBuilder::from_existing(&previous.conditions);
    match phase {
        ClusterPhase::Running => conditions.ready(true, "AllUnitsReady", "Head and workers are ready", generation),
        _ => conditions.ready(false, &phase.to_string(), &format!("Cluster is {phase}"), generation),
    };
    if inputs.plan.is_empty() && !ctx.upgrading && phase == ClusterPhase::Running {
        conditions.progressing(false, "Converged", "Observed state matches the spec", generation);
    } else {
        let message = format!(
            "{} mutations planned, {} deferred",
            inputs.plan.mutations.len(),
            inputs.plan.deferred.len()
        );
        conditions.progressing(true, "Reconciling", &message, generation);
    }
    if unhealthy.is_empty() {
        conditions.degraded(false, "Healthy", "No unit is unhealthy", generation);
    } else {
        let names: Vec<&str> = unhealthy.iter().map(|o| o.key.name.as_str()).collect();
        conditions.degraded(
            true,
            "UnitUnhealthy",
            &format!("Unhealthy past grace period: {}", names.join(", ")),
            generation,
        );
    }
    conditions.spec_valid(true, "Valid", "Spec resolved", generation);
    match inputs.plan.upgrade_blocked() {
        Some(reason @ DeferReason::DisruptionGuard) => conditions.upgrade_blocked(
            true,
            reason.as_str(),
            "Disruptive change held back while serving; set the forced upgrade override to apply it",
            generation,
        ),
        Some(reason) => conditions.upgrade_blocked(
            true,
            reason.as_str(),
            "Workers are being replaced in batches",
            generation,
        ),
        None => conditions.upgrade_blocked(false, "NotBlocked", "No recreate is held back", generation),
    };

    let last_error = match (phase, inputs.report.failure_summary()) {
        (_, Some(summary)) => Some(summary),
        (ClusterPhase::Failed, None) => previous.last_error.clone(),
        _ => None,
    };

    let spec = &cluster.spec;
    let status = RayClusterStatus {
        phase,
        desired_worker_replicas: spec.desired_workers(),
        ready_worker_replicas: groups.iter().map(|g| g.ready_replicas).sum(),
        min_worker_replicas: spec.min_workers(),
        max_worker_replicas: spec.max_workers(),
        worker_groups: groups,
        head: Some(head_info(cluster, inputs.observed)),
        endpoints: head_ports(&spec.head_group_spec.template)
            .into_iter()
            .map(|(name, port)| (name, port.to_string()))
            .collect(),
        last_applied_fingerprint: Some(inputs.fingerprint.to_string()),
        conditions: conditions.build(),
        consecutive_failures,
        unit_restarts: previous.unit_restarts.saturating_add(restarts),
        last_error,
        observed_generation: generation,
        last_update_time: Some(inputs.now.to_string()),
    };

    StatusUpdate {
        status,
        event,
        transition,
    }
}

/// Status of a cluster whose spec failed to resolve.
///
/// The phase is kept; only `SpecValid` and the bookkeeping fields change.
pub fn invalid_spec_status(cluster: &RayCluster, error: &Error, now: Timestamp) -> RayClusterStatus {
    let previous = cluster.status.clone().unwrap_or_default();
    let generation = cluster.metadata.generation;
    let mut conditions = ConditionBuilder::from_existing(&previous.conditions);
    conditions.spec_valid(false, error.reason(), &error.to_string(), generation);
    RayClusterStatus {
        conditions: conditions.build(),
        last_error: Some(error.to_string()),
        observed_generation: generation,
        last_update_time: Some(now.to_string()),
        ..previous
    }
}
