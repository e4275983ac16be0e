// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for ray-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use std::time::Duration;

use proptest::prelude::*;

use ray_operator::batch::SchedulerRegistry;
use ray_operator::config::EngineConfig;
use ray_operator::controller::cluster_state_machine::{
    ClusterEvent, ClusterStateMachine, TransitionContext, determine_event,
};
use ray_operator::controller::collector::{ObservedUnit, observe};
use ray_operator::controller::diff::{PlanPolicy, plan};
use ray_operator::crd::{
    ClusterPhase, ContainerTemplate, HeadGroupSpec, RayCluster, RayClusterSpec, WorkerGroupSpec,
};
use ray_operator::resources::{DesiredState, resolve};
use ray_operator::scheduler::backoff::delay_for;

/// Strategy for generating worker group replica counts (1-3 groups, 0-8 replicas each).
fn group_replicas() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(0..=8i32, 1..=3)
}

/// Strategy for generating random phases.
fn any_phase() -> impl Strategy<Value = ClusterPhase> {
    prop_oneof![
        Just(ClusterPhase::Initializing),
        Just(ClusterPhase::Pending),
        Just(ClusterPhase::Running),
        Just(ClusterPhase::Upgrading),
        Just(ClusterPhase::Degraded),
        Just(ClusterPhase::Failed),
        Just(ClusterPhase::Deleting),
    ]
}

/// Strategy for generating random events.
fn any_event() -> impl Strategy<Value = ClusterEvent> {
    prop_oneof![
        Just(ClusterEvent::DeletionRequested),
        Just(ClusterEvent::BudgetExhausted),
        Just(ClusterEvent::SpecChanged),
        Just(ClusterEvent::NoUnitsObserved),
        Just(ClusterEvent::UnitsStarting),
        Just(ClusterEvent::AllUnitsReady),
        Just(ClusterEvent::UpgradeInFlight),
        Just(ClusterEvent::UnitUnhealthy),
    ]
}

/// Strategy for generating observations of a pass.
fn any_context() -> impl Strategy<Value = TransitionContext> {
    (
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        0..10usize,
        any::<bool>(),
        any::<bool>(),
        0..3usize,
        any::<bool>(),
    )
        .prop_map(
            |(deleting, budget_exhausted, spec_changed, observed_units, head_ready, groups_ready, unhealthy_units, upgrading)| {
                TransitionContext {
                    deleting,
                    budget_exhausted,
                    spec_changed,
                    observed_units,
                    head_ready,
                    groups_ready,
                    unhealthy_units,
                    upgrading,
                }
            },
        )
}

fn cluster(replicas: &[i32]) -> RayCluster {
    let template = ContainerTemplate {
        image: "rayproject/ray:2.9.0".into(),
        ..Default::default()
    };
    let mut cluster = RayCluster::new(
        "prop",
        RayClusterSpec {
            head_group_spec: HeadGroupSpec {
                template: template.clone(),
                ..Default::default()
            },
            worker_group_specs: replicas
                .iter()
                .enumerate()
                .map(|(i, r)| WorkerGroupSpec {
                    group_name: format!("group-{i}"),
                    replicas: *r,
                    min_replicas: 0,
                    max_replicas: 8,
                    template: template.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some("default".into());
    cluster.metadata.uid = Some("uid-prop".into());
    cluster
}

fn desired(replicas: &[i32]) -> DesiredState {
    resolve(&cluster(replicas), &SchedulerRegistry::new(), &EngineConfig::default()).unwrap()
}

/// Observe the desired units as if they had been created verbatim.
fn as_observed(state: &DesiredState) -> Vec<ObservedUnit> {
    state.units.iter().map(|u| observe(&u.object)).collect()
}

proptest! {
    /// Resolving the same spec twice yields identical units and fingerprints.
    #[test]
    fn resolve_is_deterministic(replicas in group_replicas()) {
        prop_assert_eq!(desired(&replicas), desired(&replicas));
    }

    /// The resolver emits a head, a head Service and one Pod per replica.
    #[test]
    fn resolve_unit_count(replicas in group_replicas()) {
        let state = desired(&replicas);
        let workers: i32 = replicas.iter().sum();
        prop_assert_eq!(state.units.len(), 2 + usize::try_from(workers).unwrap());
    }

    /// Planning against an exact copy of the desired state writes nothing.
    #[test]
    fn plan_is_idempotent(replicas in group_replicas()) {
        let state = desired(&replicas);
        let result = plan(&state, &as_observed(&state), &PlanPolicy::default());
        prop_assert!(result.is_empty(), "unexpected mutations: {:?}", result.mutations);
        prop_assert!(result.deferred.is_empty());
    }

    /// Scaling a group creates or deletes exactly the difference.
    #[test]
    fn scale_delta_matches_replica_change(from in 0..=8i32, to in 0..=8i32) {
        let observed = as_observed(&desired(&[from]));
        let result = plan(&desired(&[to]), &observed, &PlanPolicy::default());
        let creates = usize::try_from((to - from).max(0)).unwrap();
        let deletes = usize::try_from((from - to).max(0)).unwrap();
        prop_assert_eq!(result.count("create"), creates);
        prop_assert_eq!(result.count("delete"), deletes);
        prop_assert_eq!(result.count("update"), 0);
    }

    /// Deletes are always ordered before creates and updates.
    #[test]
    fn deletes_precede_writes(from in 0..=8i32, to in 0..=8i32) {
        let observed = as_observed(&desired(&[from, 1]));
        let result = plan(&desired(&[to]), &observed, &PlanPolicy::default());
        let first_write = result.mutations.iter().position(|m| m.action() != "delete");
        let last_delete = result.mutations.iter().rposition(|m| m.action() == "delete");
        if let (Some(write), Some(delete)) = (first_write, last_delete) {
            prop_assert!(delete < write);
        }
    }

    /// Retry delays never exceed the cap and never shrink.
    #[test]
    fn backoff_is_bounded_and_monotonic(
        base_ms in 1..5_000u64,
        max_ms in 1..600_000u64,
        attempt in 0..64u32,
    ) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_millis(max_ms);
        let delay = delay_for(base, max, attempt);
        prop_assert!(delay <= max);
        prop_assert!(delay_for(base, max, attempt + 1) >= delay);
    }

    /// A transition either keeps the phase or lands on the event's target.
    #[test]
    fn transition_lands_on_target_or_stays(
        phase in any_phase(),
        event in any_event(),
        ctx in any_context(),
    ) {
        let sm = ClusterStateMachine::new();
        let next = sm.transition(phase, event, &ctx).phase(phase);
        prop_assert!(next == phase || next == event.target());
    }

    /// Deleting is never left.
    #[test]
    fn deleting_is_terminal(event in any_event(), ctx in any_context()) {
        let sm = ClusterStateMachine::new();
        let next = sm.transition(ClusterPhase::Deleting, event, &ctx).phase(ClusterPhase::Deleting);
        prop_assert_eq!(next, ClusterPhase::Deleting);
    }

    /// Failed is only left through a spec change.
    #[test]
    fn failed_exits_only_on_spec_change(event in any_event(), ctx in any_context()) {
        let sm = ClusterStateMachine::new();
        let next = sm.transition(ClusterPhase::Failed, event, &ctx).phase(ClusterPhase::Failed);
        if event != ClusterEvent::SpecChanged {
            prop_assert_eq!(next, ClusterPhase::Failed);
        }
    }

    /// A deletion request always wins.
    #[test]
    fn deletion_has_priority(phase in any_phase(), mut ctx in any_context()) {
        ctx.deleting = true;
        prop_assert_eq!(determine_event(phase, &ctx), ClusterEvent::DeletionRequested);
    }
}
