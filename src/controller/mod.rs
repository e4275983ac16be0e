//! Controller module for ray-operator.
//!
//! Contains the reconcilers, their state machines, the diff engine, error
//! handling, status management and validation logic.
//!
//! Three reconcilers share one work queue:
//! - RayCluster (cluster_* modules plus collector, diff and apply)
//! - RayService (service_* modules)
//! - RayJob (job_* modules)

use std::sync::Arc;

use crate::gateway::ApiGateway;
use crate::resources::OwnerKind;
use crate::scheduler::{ObjectKey, ReconcileOutcome, Reconciler};
use crate::submission::JobSubmissionClient;

// Shared modules
pub mod common;
pub mod context;
pub mod error;
pub mod status;

// RayCluster controller
pub mod apply;
pub mod cluster_reconciler;
pub mod cluster_state_machine;
pub mod cluster_status;
pub mod cluster_validation;
pub mod collector;
pub mod diff;

// RayService controller
pub mod service_plan;
pub mod service_reconciler;

// RayJob controller
pub mod job_reconciler;
pub mod job_state_machine;

use context::Context;

/// Routes each key to the reconciler of its kind.
pub struct Dispatcher<G, S> {
    ctx: Arc<Context<G, S>>,
}

impl<G: ApiGateway, S: JobSubmissionClient> Dispatcher<G, S> {
    pub fn new(ctx: Arc<Context<G, S>>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context<G, S> {
        &self.ctx
    }
}

impl<G: ApiGateway, S: JobSubmissionClient> Reconciler for Dispatcher<G, S> {
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileOutcome {
        match key.kind {
            OwnerKind::RayCluster => cluster_reconciler::reconcile(key, &self.ctx).await,
            OwnerKind::RayService => service_reconciler::reconcile(key, &self.ctx).await,
            OwnerKind::RayJob => job_reconciler::reconcile(key, &self.ctx).await,
        }
    }
}
