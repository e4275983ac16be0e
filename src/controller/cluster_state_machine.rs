//! Finite state machine for the RayCluster phase.
//!
//! Every pass derives one event from the observed state and applies it
//! through an explicit transition table. Only listed transitions and
//! self-transitions are valid; anything else keeps the current phase.
//!
//! ## Lifecycle
//!
//! Initializing → Pending → Running, with Upgrading and Degraded as detours
//! from Running that return to it without a spec change.
//!
//! ## Terminal phases
//!
//! Failed is left only when the spec changes. Deleting is never left.

use std::fmt;

use crate::crd::ClusterPhase;

/// Events that drive phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// The cluster has a deletion timestamp.
    DeletionRequested,
    /// Consecutive failed passes reached the failure budget.
    BudgetExhausted,
    /// The spec fingerprint differs from the last applied one.
    SpecChanged,
    /// No units were observed.
    NoUnitsObserved,
    /// Units exist but the head or some group is not ready yet.
    UnitsStarting,
    /// Head ready and every group at its desired ready count.
    AllUnitsReady,
    /// Units are being replaced.
    UpgradeInFlight,
    /// A unit has been unhealthy past the grace period.
    UnitUnhealthy,
}

impl ClusterEvent {
    /// Phase an event leads to when the transition is allowed.
    pub fn target(&self) -> ClusterPhase {
        match self {
            ClusterEvent::DeletionRequested => ClusterPhase::Deleting,
            ClusterEvent::BudgetExhausted => ClusterPhase::Failed,
            ClusterEvent::SpecChanged | ClusterEvent::UnitsStarting => ClusterPhase::Pending,
            ClusterEvent::NoUnitsObserved => ClusterPhase::Initializing,
            ClusterEvent::AllUnitsReady => ClusterPhase::Running,
            ClusterEvent::UpgradeInFlight => ClusterPhase::Upgrading,
            ClusterEvent::UnitUnhealthy => ClusterPhase::Degraded,
        }
    }
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEvent::DeletionRequested => write!(f, "DeletionRequested"),
            ClusterEvent::BudgetExhausted => write!(f, "BudgetExhausted"),
            ClusterEvent::SpecChanged => write!(f, "SpecChanged"),
            ClusterEvent::NoUnitsObserved => write!(f, "NoUnitsObserved"),
            ClusterEvent::UnitsStarting => write!(f, "UnitsStarting"),
            ClusterEvent::AllUnitsReady => write!(f, "AllUnitsReady"),
            ClusterEvent::UpgradeInFlight => write!(f, "UpgradeInFlight"),
            ClusterEvent::UnitUnhealthy => write!(f, "UnitUnhealthy"),
        }
    }
}

/// Observations a pass feeds into the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionContext {
    pub deleting: bool,
    pub budget_exhausted: bool,
    pub spec_changed: bool,
    /// Units owned by the cluster, terminating ones included.
    pub observed_units: usize,
    pub head_ready: bool,
    /// Every worker group has as many ready workers as desired.
    pub groups_ready: bool,
    /// Units unhealthy for longer than the grace period.
    pub unhealthy_units: usize,
    pub upgrading: bool,
}

impl TransitionContext {
    pub fn all_units_ready(&self) -> bool {
        self.head_ready && self.groups_ready
    }
}

/// A permitted transition.
#[derive(Debug)]
pub struct Transition {
    pub from: ClusterPhase,
    pub to: ClusterPhase,
    pub event: ClusterEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    Success {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: ClusterPhase,
        event: ClusterEvent,
    },
    GuardFailed {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Phase after applying the result to `current`.
    pub fn phase(&self, current: ClusterPhase) -> ClusterPhase {
        match self {
            TransitionResult::Success { to, .. } => *to,
            _ => current,
        }
    }
}

/// Transition table for the RayCluster phase.
pub struct ClusterStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ClusterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateMachine {
    pub fn new() -> Self {
        use ClusterEvent as E;
        use ClusterPhase as P;

        let mut transitions = Vec::new();
        // Every live phase shares the same exits.
        for from in [P::Initializing, P::Pending, P::Running, P::Upgrading, P::Degraded] {
            transitions.extend([
                Transition::new(from, P::Initializing, E::NoUnitsObserved, "No units observed"),
                Transition::new(from, P::Pending, E::UnitsStarting, "Units starting"),
                Transition::new(from, P::Running, E::AllUnitsReady, "All units ready"),
                Transition::new(from, P::Upgrading, E::UpgradeInFlight, "Replacing units"),
                Transition::new(from, P::Degraded, E::UnitUnhealthy, "Unit unhealthy past grace period"),
                Transition::new(from, P::Failed, E::BudgetExhausted, "Failure budget exhausted"),
                Transition::new(from, P::Deleting, E::DeletionRequested, "Deletion requested"),
            ]);
        }
        transitions.push(Transition::new(
            P::Failed,
            P::Pending,
            E::SpecChanged,
            "Spec changed, retrying",
        ));

        Self { transitions }
    }

    /// Attempt to apply `event` to `current`.
    pub fn transition(
        &self,
        current: ClusterPhase,
        event: ClusterEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let found = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        let (to, description) = match found {
            Some(t) => (t.to, t.description),
            None if event.target() == current => (current, "Unchanged"),
            None => return TransitionResult::InvalidTransition { current, event },
        };

        match check_guard(to, event, ctx) {
            Some(reason) => TransitionResult::GuardFailed {
                from: current,
                to,
                event,
                reason,
            },
            None => TransitionResult::Success {
                from: current,
                to,
                event,
                description,
            },
        }
    }

    pub fn can_transition(&self, from: ClusterPhase, event: ClusterEvent) -> bool {
        event.target() == from
            || self
                .transitions
                .iter()
                .any(|t| t.from == from && t.event == event)
    }

    pub fn valid_events(&self, state: ClusterPhase) -> Vec<ClusterEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }
}

fn check_guard(to: ClusterPhase, event: ClusterEvent, ctx: &TransitionContext) -> Option<String> {
    match (to, event) {
        (ClusterPhase::Running, ClusterEvent::AllUnitsReady) if !ctx.all_units_ready() => Some(
            format!(
                "head ready: {}, groups ready: {}",
                ctx.head_ready, ctx.groups_ready
            ),
        ),
        (ClusterPhase::Degraded, ClusterEvent::UnitUnhealthy) if ctx.unhealthy_units == 0 => {
            Some("no unit is unhealthy past the grace period".to_string())
        }
        _ => None,
    }
}

/// Derive the event of a pass.
///
/// Priority: deletion, budget, spec change out of Failed, no units,
/// unhealthy units, replacement in flight, readiness.
pub fn determine_event(current: ClusterPhase, ctx: &TransitionContext) -> ClusterEvent {
    if ctx.deleting {
        return ClusterEvent::DeletionRequested;
    }
    if ctx.budget_exhausted {
        return ClusterEvent::BudgetExhausted;
    }
    if current == ClusterPhase::Failed && ctx.spec_changed {
        return ClusterEvent::SpecChanged;
    }
    if ctx.observed_units == 0 {
        return ClusterEvent::NoUnitsObserved;
    }
    if ctx.unhealthy_units > 0 {
        return ClusterEvent::UnitUnhealthy;
    }
    if ctx.upgrading {
        return ClusterEvent::UpgradeInFlight;
    }
    if ctx.all_units_ready() {
        ClusterEvent::AllUnitsReady
    } else {
        ClusterEvent::UnitsStarting
    }
}
