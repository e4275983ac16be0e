//! Reconciliation diff engine.
//!
//! Compares the desired units of an owner with the observed ones and produces
//! an ordered mutation plan. Planning is pure; execution lives in `apply`.
//!
//! ## Pairing
//!
//! Units are paired by `UnitKey`. Missing units are created, units whose
//! mutable fingerprint drifted are updated in place, units whose identity
//! fingerprint drifted are deleted and recreated on a later pass, and units
//! nobody wants are deleted.
//!
//! ## Disruption guard
//!
//! While the head Pod is ready the cluster is serving. A serving cluster does
//! not get its head, endpoints or placement group recreated unless the forced
//! upgrade override is set. Workers follow the same rule, except that a
//! non-zero `worker_upgrade_batch_size` lets them roll a few at a time.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::EngineConfig;
use crate::controller::collector::ObservedUnit;
use crate::resources::{DesiredState, DesiredUnit, UnitKey, UnitKind, UnitRole};

/// Knobs of the disruption guard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanPolicy {
    /// Release every recreate at once, even while serving.
    pub forced_upgrade: bool,
    /// Worker recreates released per group and pass while serving.
    pub worker_upgrade_batch_size: u32,
}

impl PlanPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            forced_upgrade: config.forced_upgrade,
            worker_upgrade_batch_size: config.worker_upgrade_batch_size,
        }
    }
}

/// Why a unit is being deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// Present but no longer desired.
    Undesired,
    /// Identity drifted; a create follows once the delete is observed.
    Recreate,
    /// The unit exited and will not recover.
    FailedUnit,
}

/// A single write against the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create(DesiredUnit),
    Update {
        unit: DesiredUnit,
        /// Precondition taken from the observed unit.
        resource_version: Option<String>,
    },
    Delete {
        key: UnitKey,
        role: UnitRole,
        reason: DeleteReason,
    },
}

impl Mutation {
    pub fn key(&self) -> &UnitKey {
        match self {
            Mutation::Create(unit) | Mutation::Update { unit, .. } => &unit.key,
            Mutation::Delete { key, .. } => key,
        }
    }

    pub fn role(&self) -> &UnitRole {
        match self {
            Mutation::Create(unit) | Mutation::Update { unit, .. } => &unit.role,
            Mutation::Delete { role, .. } => role,
        }
    }

    /// Metric and log label of the mutation.
    pub fn action(&self) -> &'static str {
        match self {
            Mutation::Create(_) => "create",
            Mutation::Update { .. } => "update",
            Mutation::Delete { .. } => "delete",
        }
    }

    fn sort_key(&self) -> (u8, &UnitKey) {
        (self.role().rank(), self.key())
    }
}

/// Why a mutation was held back this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// Recreate refused while the cluster is serving.
    DisruptionGuard,
    /// Recreate waits for its turn in a rolling worker upgrade.
    RollingBatch,
    /// Create waits for a terminating unit with the same key to go away.
    AwaitingDeletion,
}

impl DeferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferReason::DisruptionGuard => "DisruptiveChangeBlocked",
            DeferReason::RollingBatch => "RollingUpgrade",
            DeferReason::AwaitingDeletion => "AwaitingDeletion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deferral {
    pub key: UnitKey,
    pub role: UnitRole,
    pub reason: DeferReason,
}

/// Ordered mutations plus everything that was deferred.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationPlan {
    pub mutations: Vec<Mutation>,
    pub deferred: Vec<Deferral>,
}

impl MutationPlan {
    /// True when there is nothing to write this pass.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn count(&self, action: &str) -> usize {
        self.mutations.iter().filter(|m| m.action() == action).count()
    }

    /// A replacement is in flight: recreates were released, a rolling batch
    /// is waiting, or creates wait for their predecessor to terminate.
    pub fn upgrading(&self) -> bool {
        self.mutations.iter().any(|m| {
            matches!(
                m,
                Mutation::Delete {
                    reason: DeleteReason::Recreate,
                    ..
                }
            )
        }) || self.deferred.iter().any(|d| {
            matches!(
                d.reason,
                DeferReason::AwaitingDeletion | DeferReason::RollingBatch
            )
        })
    }

    /// Reason recreates are being held back, if any.
    ///
    /// The guard wins over a rolling batch when both apply.
    pub fn upgrade_blocked(&self) -> Option<DeferReason> {
        let has = |reason| self.deferred.iter().any(|d| d.reason == reason);
        if has(DeferReason::DisruptionGuard) {
            Some(DeferReason::DisruptionGuard)
        } else if has(DeferReason::RollingBatch) {
            Some(DeferReason::RollingBatch)
        } else {
            None
        }
    }
}

/// Whether the observed head Pod is ready.
pub fn is_serving(observed: &[ObservedUnit]) -> bool {
    observed
        .iter()
        .any(|o| o.role == UnitRole::Head && o.key.kind == UnitKind::Pod && o.is_ready())
}

/// Plan the mutations that move `observed` towards `desired`.
pub fn plan(desired: &DesiredState, observed: &[ObservedUnit], policy: &PlanPolicy) -> MutationPlan {
    let by_key: BTreeMap<&UnitKey, &ObservedUnit> = observed.iter().map(|o| (&o.key, o)).collect();

    let mut deletes = Vec::new();
    let mut writes = Vec::new();
    let mut deferred = Vec::new();
    let mut recreates: Vec<&DesiredUnit> = Vec::new();

    for unit in &desired.units {
        let Some(current) = by_key.get(&unit.key) else {
            writes.push(Mutation::Create(unit.clone()));
            continue;
        };
        if current.is_terminating() {
            deferred.push(Deferral {
                key: unit.key.clone(),
                role: unit.role.clone(),
                reason: DeferReason::AwaitingDeletion,
            });
        } else if current.is_failed() {
            deletes.push(Mutation::Delete {
                key: unit.key.clone(),
                role: unit.role.clone(),
                reason: DeleteReason::FailedUnit,
            });
        } else if current.identity_hash.as_deref() != Some(unit.identity_hash.as_str()) {
            recreates.push(unit);
        } else if current.mutable_hash.as_deref() != Some(unit.mutable_hash.as_str()) {
            writes.push(Mutation::Update {
                unit: unit.clone(),
                resource_version: current.resource_version.clone(),
            });
        }
    }

    let desired_keys = desired.keys();
    for unit in observed {
        if !desired_keys.contains(&unit.key) && !unit.is_terminating() {
            deletes.push(Mutation::Delete {
                key: unit.key.clone(),
                role: unit.role.clone(),
                reason: DeleteReason::Undesired,
            });
        }
    }

    let guarded = is_serving(observed) && !policy.forced_upgrade;
    let (released, held) = guard(desired, observed, recreates, guarded, policy);
    deletes.extend(released.into_iter().map(|unit| Mutation::Delete {
        key: unit.key.clone(),
        role: unit.role.clone(),
        reason: DeleteReason::Recreate,
    }));
    deferred.extend(held);

    deletes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    writes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    deletes.extend(writes);

    MutationPlan {
        mutations: deletes,
        deferred,
    }
}

/// Split recreate candidates into released and deferred.
fn guard<'a>(
    desired: &DesiredState,
    observed: &[ObservedUnit],
    recreates: Vec<&'a DesiredUnit>,
    guarded: bool,
    policy: &PlanPolicy,
) -> (Vec<&'a DesiredUnit>, Vec<Deferral>) {
    if !guarded {
        return (recreates, Vec::new());
    }

    let defer = |unit: &DesiredUnit, reason| Deferral {
        key: unit.key.clone(),
        role: unit.role.clone(),
        reason,
    };

    let (workers, others): (Vec<_>, Vec<_>) = recreates.into_iter().partition(|u| u.role.is_worker());
    let mut held: Vec<Deferral> = others
        .iter()
        .map(|u| defer(u, DeferReason::DisruptionGuard))
        .collect();

    // Workers never roll ahead of a refused head or endpoint.
    if !others.is_empty() || policy.worker_upgrade_batch_size == 0 {
        held.extend(workers.iter().map(|u| defer(u, DeferReason::DisruptionGuard)));
        return (Vec::new(), held);
    }

    let batch = usize::try_from(policy.worker_upgrade_batch_size).unwrap_or(usize::MAX);
    let mut by_group: BTreeMap<&str, Vec<&'a DesiredUnit>> = BTreeMap::new();
    for unit in workers {
        by_group.entry(unit.role.group()).or_default().push(unit);
    }

    let mut released = Vec::new();
    for (group, mut candidates) in by_group {
        candidates.sort_by(|a, b| a.key.cmp(&b.key));
        let take = if group_settled(desired, observed, group) {
            batch
        } else {
            0
        };
        for (i, unit) in candidates.into_iter().enumerate() {
            if i < take {
                released.push(unit);
            } else {
                held.push(defer(unit, DeferReason::RollingBatch));
            }
        }
    }
    (released, held)
}

/// Every desired worker of the group exists and every observed one is ready.
fn group_settled(desired: &DesiredState, observed: &[ObservedUnit], group: &str) -> bool {
    let in_group = |role: &UnitRole| role.is_worker() && role.group() == group;
    let present: BTreeSet<&UnitKey> = observed
        .iter()
        .filter(|o| in_group(&o.role))
        .map(|o| &o.key)
        .collect();
    let all_present = desired
        .units
        .iter()
        .filter(|u| in_group(&u.role))
        .all(|u| present.contains(&u.key));
    all_present
        && observed
            .iter()
            .filter(|o| in_group(&o.role))
            .all(ObservedUnit::is_ready)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::batch::SchedulerRegistry;
    use crate::controller::collector::UnitHealth;
    use crate::crd::{ContainerTemplate, HeadGroupSpec, RayCluster, RayClusterSpec, WorkerGroupSpec};
    use crate::resources::resolve;

    fn cluster(replicas: i32, image: &str) -> RayCluster {
        let template = ContainerTemplate {
            image: image.into(),
            ..Default::default()
        };
        let mut cluster = RayCluster::new(
            "demo",
            RayClusterSpec {
                head_group_spec: HeadGroupSpec {
                    template: template.clone(),
                    ..Default::default()
                },
                worker_group_specs: vec![WorkerGroupSpec {
                    group_name: "small".into(),
                    replicas,
                    min_replicas: 0,
                    max_replicas: 10,
                    template,
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("ml".into());
        cluster.metadata.uid = Some("uid-1".into());
        cluster
    }

    fn desired(replicas: i32, image: &str) -> DesiredState {
        resolve(
            &cluster(replicas, image),
            &SchedulerRegistry::new(),
            &EngineConfig::default(),
        )
        .unwrap()
    }

    /// Observed state matching `state`, with every unit ready.
    fn converged(state: &DesiredState) -> Vec<ObservedUnit> {
        state
            .units
            .iter()
            .map(|u| ObservedUnit {
                key: u.key.clone(),
                role: u.role.clone(),
                resource_version: Some("7".into()),
                identity_hash: Some(u.identity_hash.clone()),
                mutable_hash: Some(u.mutable_hash.clone()),
                health: UnitHealth::Ready,
                pod_ip: None,
                cluster_ip: None,
            })
            .collect()
    }

    fn deletes(plan: &MutationPlan) -> Vec<&str> {
        plan.mutations
            .iter()
            .filter(|m| matches!(m, Mutation::Delete { .. }))
            .map(|m| m.key().name.as_str())
            .collect()
    }

    #[test]
    fn test_converged_plan_is_empty() {
        let state = desired(2, "rayproject/ray:2.9.0");
        let plan = plan(&state, &converged(&state), &PlanPolicy::default());
        assert!(plan.is_empty());
        assert!(plan.deferred.is_empty());
        assert!(!plan.upgrading());
    }

    #[test]
    fn test_empty_observation_creates_in_rank_order() {
        let state = desired(2, "rayproject/ray:2.9.0");
        let plan = plan(&state, &[], &PlanPolicy::default());
        let names: Vec<_> = plan.mutations.iter().map(|m| m.key().name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "demo-head",
                "demo-head-svc",
                "demo-small-worker-0",
                "demo-small-worker-1"
            ]
        );
        assert!(plan.mutations.iter().all(|m| m.action() == "create"));
    }

    #[test]
    fn test_scale_up_creates_only_the_delta() {
        let before = desired(3, "rayproject/ray:2.9.0");
        let after = desired(5, "rayproject/ray:2.9.0");
        let plan = plan(&after, &converged(&before), &PlanPolicy::default());
        assert_eq!(plan.mutations.len(), 2);
        assert_eq!(plan.count("create"), 2);
        assert_eq!(plan.mutations[0].key().name, "demo-small-worker-3");
        assert_eq!(plan.mutations[1].key().name, "demo-small-worker-4");
    }

    #[test]
    fn test_scale_down_deletes_only_the_delta() {
        let before = desired(3, "rayproject/ray:2.9.0");
        let after = desired(1, "rayproject/ray:2.9.0");
        let plan = plan(&after, &converged(&before), &PlanPolicy::default());
        assert_eq!(deletes(&plan), vec!["demo-small-worker-1", "demo-small-worker-2"]);
        assert_eq!(plan.mutations.len(), 2);
    }

    #[test]
    fn test_guard_refuses_image_change_while_serving() {
        let before = desired(2, "rayproject/ray:2.9.0");
        let after = desired(2, "rayproject/ray:2.10.0");
        let plan = plan(&after, &converged(&before), &PlanPolicy::default());
        assert!(deletes(&plan).is_empty());
        assert_eq!(plan.deferred.len(), 3);
        assert_eq!(plan.upgrade_blocked(), Some(DeferReason::DisruptionGuard));
        assert!(!plan.upgrading());
    }

    #[test]
    fn test_forced_upgrade_recreates_everything() {
        let before = desired(2, "rayproject/ray:2.9.0");
        let after = desired(2, "rayproject/ray:2.10.0");
        let policy = PlanPolicy {
            forced_upgrade: true,
            ..Default::default()
        };
        let plan = plan(&after, &converged(&before), &policy);
        assert_eq!(
            deletes(&plan),
            vec!["demo-head", "demo-small-worker-0", "demo-small-worker-1"]
        );
        assert!(plan.upgrading());
        assert_eq!(plan.upgrade_blocked(), None);
    }

    #[test]
    fn test_not_serving_releases_recreates() {
        let before = desired(1, "rayproject/ray:2.9.0");
        let after = desired(1, "rayproject/ray:2.10.0");
        let mut observed = converged(&before);
        for unit in &mut observed {
            unit.health = UnitHealth::NotReady { since: None };
        }
        let plan = plan(&after, &observed, &PlanPolicy::default());
        assert_eq!(deletes(&plan), vec!["demo-head", "demo-small-worker-0"]);
    }

    #[test]
    fn test_rolling_batch_releases_workers_in_turn() {
        let before = desired(3, "rayproject/ray:2.9.0");
        let mut after_cluster = cluster(3, "rayproject/ray:2.9.0");
        after_cluster.spec.worker_group_specs[0].template.image = "rayproject/ray:2.10.0".into();
        let after = resolve(
            &after_cluster,
            &SchedulerRegistry::new(),
            &EngineConfig::default(),
        )
        .unwrap();
        let policy = PlanPolicy {
            worker_upgrade_batch_size: 1,
            ..Default::default()
        };

        let mut observed = converged(&before);
        let first = plan(&after, &observed, &policy);
        assert_eq!(deletes(&first), vec!["demo-small-worker-0"]);
        assert_eq!(first.upgrade_blocked(), Some(DeferReason::RollingBatch));
        assert!(first.upgrading());

        // While the replacement is not ready the rest of the group waits.
        let replaced = after.get(&UnitKey::pod("demo-small-worker-0")).unwrap();
        let slot = observed
            .iter_mut()
            .find(|o| o.key.name == "demo-small-worker-0")
            .unwrap();
        slot.identity_hash = Some(replaced.identity_hash.clone());
        slot.health = UnitHealth::NotReady { since: None };
        let second = plan(&after, &observed, &policy);
        assert!(deletes(&second).is_empty());
        assert_eq!(second.deferred.len(), 2);
    }

    #[test]
    fn test_failed_unit_is_deleted_even_while_serving() {
        let state = desired(2, "rayproject/ray:2.9.0");
        let mut observed = converged(&state);
        observed
            .iter_mut()
            .find(|o| o.key.name == "demo-small-worker-1")
            .unwrap()
            .health = UnitHealth::Failed { since: None };
        let plan = plan(&state, &observed, &PlanPolicy::default());
        assert_eq!(plan.mutations.len(), 1);
        assert!(matches!(
            &plan.mutations[0],
            Mutation::Delete {
                reason: DeleteReason::FailedUnit,
                ..
            }
        ));
    }

    #[test]
    fn test_terminating_unit_defers_create() {
        let state = desired(1, "rayproject/ray:2.9.0");
        let mut observed = converged(&state);
        observed
            .iter_mut()
            .find(|o| o.key.name == "demo-small-worker-0")
            .unwrap()
            .health = UnitHealth::Terminating;
        let plan = plan(&state, &observed, &PlanPolicy::default());
        assert!(plan.is_empty());
        assert_eq!(plan.deferred[0].reason, DeferReason::AwaitingDeletion);
        assert!(plan.upgrading());
    }

    #[test]
    fn test_mutable_drift_updates_with_resource_version() {
        let state = desired(1, "rayproject/ray:2.9.0");
        let mut observed = converged(&state);
        observed[1].mutable_hash = Some("stale".into());
        let plan = plan(&state, &observed, &PlanPolicy::default());
        match &plan.mutations[..] {
            [Mutation::Update { unit, resource_version }] => {
                assert_eq!(unit.key, observed[1].key);
                assert_eq!(resource_version.as_deref(), Some("7"));
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_deletes_precede_creates() {
        let before = desired(2, "rayproject/ray:2.9.0");
        let mut after_cluster = cluster(2, "rayproject/ray:2.9.0");
        after_cluster.spec.worker_group_specs[0].scale_strategy.workers_to_delete =
            vec!["demo-small-worker-0".into()];
        let after = resolve(
            &after_cluster,
            &SchedulerRegistry::new(),
            &EngineConfig::default(),
        )
        .unwrap();
        let plan = plan(&after, &converged(&before), &PlanPolicy::default());
        let actions: Vec<_> = plan.mutations.iter().map(Mutation::action).collect();
        assert_eq!(actions, vec!["delete", "create"]);
        assert_eq!(plan.mutations[1].key().name, "demo-small-worker-2");
    }
}
