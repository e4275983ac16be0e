//! Batch-scheduler plugins for gang scheduling.
//!
//! A plugin contributes an optional placement-group unit for a cluster and
//! annotates every Pod with a reference to it. Plugins are registered once at
//! startup in a [`SchedulerRegistry`] and looked up by policy name during
//! resolution. An unknown name is a configuration error.

pub mod volcano;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;

use crate::controller::error::{Error, Result};
use crate::crd::{GangSchedulingSpec, RayCluster};
use crate::resources::units::PlacementGroup;

pub use volcano::VolcanoScheduler;

/// Name of the no-op strategy used when no gang policy is set.
pub const DEFAULT_POLICY: &str = "default";

/// Gang-scheduling strategy.
pub trait BatchScheduler: Send + Sync {
    /// Registry name of this strategy.
    fn name(&self) -> &'static str;

    /// Placement group required by `cluster`, without ownership metadata.
    ///
    /// Returns `Error::InvalidSchedulerPolicy` when the policy cannot be honored.
    fn placement_unit(
        &self,
        cluster: &RayCluster,
        policy: &GangSchedulingSpec,
    ) -> Result<Option<PlacementGroup>>;

    /// Attach the placement-group reference to a Pod of `cluster`.
    fn annotate(&self, pod: &mut Pod, cluster: &RayCluster, policy: &GangSchedulingSpec);
}

/// Strategy that leaves scheduling to the platform default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScheduler;

impl BatchScheduler for NoopScheduler {
    fn name(&self) -> &'static str {
        DEFAULT_POLICY
    }

    fn placement_unit(
        &self,
        _cluster: &RayCluster,
        _policy: &GangSchedulingSpec,
    ) -> Result<Option<PlacementGroup>> {
        Ok(None)
    }

    fn annotate(&self, _pod: &mut Pod, _cluster: &RayCluster, _policy: &GangSchedulingSpec) {}
}

/// Read-only name → strategy lookup, populated at startup.
#[derive(Clone)]
pub struct SchedulerRegistry {
    plugins: BTreeMap<&'static str, Arc<dyn BatchScheduler>>,
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl SchedulerRegistry {
    /// Registry containing only the no-op strategy.
    pub fn new() -> Self {
        let mut plugins: BTreeMap<&'static str, Arc<dyn BatchScheduler>> = BTreeMap::new();
        plugins.insert(DEFAULT_POLICY, Arc::new(NoopScheduler));
        Self { plugins }
    }

    /// Registry for the operator's configuration.
    pub fn from_config(enable_batch_scheduler: bool) -> Self {
        let registry = Self::new();
        if enable_batch_scheduler {
            registry.with_plugin(Arc::new(VolcanoScheduler))
        } else {
            registry
        }
    }

    /// Register a strategy under its own name.
    pub fn with_plugin(mut self, plugin: Arc<dyn BatchScheduler>) -> Self {
        self.plugins.insert(plugin.name(), plugin);
        self
    }

    /// Look up a strategy. `None` selects the no-op strategy.
    pub fn resolve(&self, policy: Option<&str>) -> Result<&dyn BatchScheduler> {
        let name = policy.unwrap_or(DEFAULT_POLICY);
        self.plugins
            .get(name)
            .map(|p| p.as_ref())
            .ok_or_else(|| Error::UnknownSchedulerPolicy(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.keys().copied().collect()
    }
}
