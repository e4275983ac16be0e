//! Plan execution.
//!
//! Mutations are executed one by one in plan order. A failing mutation does
//! not stop the rest of the plan; it is recorded in the report and logged.

use tracing::{debug, warn};

use crate::controller::diff::{DeleteReason, Mutation, MutationPlan};
use crate::controller::error::Error;
use crate::gateway::ApiGateway;
use crate::resources::UnitKey;

/// Outcome of executing a plan.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Mutations that took effect, or were already in effect.
    pub applied: Vec<Mutation>,
    pub failures: Vec<(UnitKey, Error)>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failed units deleted for replacement this pass.
    pub fn restarts(&self) -> usize {
        self.applied
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    Mutation::Delete {
                        reason: DeleteReason::FailedUnit,
                        ..
                    }
                )
            })
            .count()
    }

    /// Whether some failure will not go away by retrying.
    pub fn has_persistent_failure(&self) -> bool {
        self.failures.iter().any(|(_, e)| !e.is_retryable())
    }

    pub fn applied_count(&self, action: &str) -> usize {
        self.applied.iter().filter(|m| m.action() == action).count()
    }

    /// Human-readable summary of the failures.
    pub fn failure_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        Some(
            self.failures
                .iter()
                .map(|(key, err)| format!("{key}: {err}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Execute every mutation of `plan` in `namespace`.
pub async fn execute<G: ApiGateway>(gateway: &G, namespace: &str, plan: &MutationPlan) -> ApplyReport {
    let mut report = ApplyReport::default();

    for mutation in &plan.mutations {
        let result = match mutation {
            Mutation::Create(unit) => match gateway.create_unit(namespace, unit).await {
                Err(e) if e.is_already_exists() => {
                    debug!(unit = %unit.key, "Unit already exists");
                    Ok(())
                }
                other => other,
            },
            Mutation::Update {
                unit,
                resource_version,
            } => {
                gateway
                    .update_unit(namespace, unit, resource_version.as_deref())
                    .await
            }
            Mutation::Delete { key, .. } => match gateway.delete_unit(namespace, key).await {
                Err(e) if e.is_not_found() => {
                    debug!(unit = %key, "Unit already gone");
                    Ok(())
                }
                other => other,
            },
        };

        match result {
            Ok(()) => report.applied.push(mutation.clone()),
            Err(e) => {
                warn!(
                    unit = %mutation.key(),
                    action = mutation.action(),
                    error = %e,
                    "Mutation failed"
                );
                report.failures.push((mutation.key().clone(), e));
            }
        }
    }

    report
}
