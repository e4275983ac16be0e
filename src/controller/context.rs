//! Shared context for the controllers.
//!
//! The Context struct holds everything a reconcile pass needs besides the
//! key itself: the platform gateway, the scheduler registry, the engine
//! options, the job submission client and the optional health state.

use std::sync::Arc;

use crate::batch::SchedulerRegistry;
use crate::config::EngineConfig;
use crate::gateway::{ApiGateway, EventRecord};
use crate::health::HealthState;
use crate::resources::OwnerIdentity;
use crate::scheduler::ObjectKey;
use crate::submission::JobSubmissionClient;

/// Shared context for the controllers
pub struct Context<G, S> {
    pub gateway: Arc<G>,
    /// Gang-scheduling plugins, read-only after startup
    pub registry: Arc<SchedulerRegistry>,
    pub config: EngineConfig,
    pub submission: Arc<S>,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl<G: ApiGateway, S: JobSubmissionClient> Context<G, S> {
    /// Create a new context
    pub fn new(
        gateway: Arc<G>,
        registry: Arc<SchedulerRegistry>,
        config: EngineConfig,
        submission: Arc<S>,
    ) -> Self {
        Self {
            gateway,
            registry,
            config,
            submission,
            health_state: None,
        }
    }

    pub fn with_health_state(mut self, health_state: Arc<HealthState>) -> Self {
        self.health_state = Some(health_state);
        self
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event(
        &self,
        owner: &OwnerIdentity,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.gateway
            .record_event(EventRecord::normal(owner, reason, action, note))
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event(
        &self,
        owner: &OwnerIdentity,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.gateway
            .record_event(EventRecord::warning(owner, reason, action, note))
            .await;
    }

    pub fn record_reconcile(&self, key: &ObjectKey, duration_secs: f64) {
        if let Some(health) = &self.health_state {
            health.metrics.record_reconcile(
                key.kind.as_str(),
                &key.namespace,
                &key.name,
                duration_secs,
            );
        }
    }

    pub fn record_error(&self, key: &ObjectKey) {
        if let Some(health) = &self.health_state {
            health
                .metrics
                .record_error(key.kind.as_str(), &key.namespace, &key.name);
        }
    }

    pub fn record_mutations(&self, action: &str, count: usize) {
        if let Some(health) = &self.health_state {
            health
                .metrics
                .record_mutations(action, u64::try_from(count).unwrap_or(u64::MAX));
        }
    }

    pub fn set_worker_replicas(&self, key: &ObjectKey, desired: i32, ready: i32) {
        if let Some(health) = &self.health_state {
            health.metrics.set_worker_replicas(
                &key.namespace,
                &key.name,
                i64::from(desired),
                i64::from(ready),
            );
        }
    }
}
