//! Platform API gateway.
//!
//! Every read and write the reconcilers perform goes through [`ApiGateway`].
//! [`KubeGateway`] talks to the Kubernetes API server; [`InMemoryGateway`]
//! is a deterministic in-process platform used by the test suites.

pub mod kubernetes;
pub mod memory;

use crate::controller::error::Result;
use crate::crd::{RayCluster, RayClusterStatus, RayJob, RayJobStatus, RayService, RayServiceStatus};
use crate::resources::units::{DesiredUnit, OwnerIdentity, OwnerKind, UnitKey, UnitObject};
use crate::scheduler::ObjectKey;

pub use kubernetes::KubeGateway;
pub use memory::InMemoryGateway;

/// Finalizer placed on RayClusters so their units are swept before removal.
pub const CLUSTER_FINALIZER: &str = "ray.io/cluster-finalizer";

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// A platform event attached to a managed resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: OwnerKind,
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub severity: EventSeverity,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

impl EventRecord {
    pub fn normal(owner: &OwnerIdentity, reason: &str, action: &str, note: Option<String>) -> Self {
        Self::new(owner, EventSeverity::Normal, reason, action, note)
    }

    pub fn warning(owner: &OwnerIdentity, reason: &str, action: &str, note: Option<String>) -> Self {
        Self::new(owner, EventSeverity::Warning, reason, action, note)
    }

    fn new(
        owner: &OwnerIdentity,
        severity: EventSeverity,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) -> Self {
        Self {
            kind: owner.kind,
            namespace: owner.namespace.clone(),
            name: owner.name.clone(),
            uid: Some(owner.uid.clone()),
            severity,
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        }
    }
}

/// Operations the reconcilers need from the platform.
///
/// Unit writes carry the names computed by the resolver. Errors keep their
/// platform meaning: `is_already_exists`, `is_not_found` and `is_conflict`
/// classify them independently of the backing implementation.
pub trait ApiGateway: Send + Sync + 'static {
    /// List the units selected by the owner's label in its namespace.
    ///
    /// The result is not filtered by owner uid; callers do that.
    fn list_units(
        &self,
        owner: &OwnerIdentity,
    ) -> impl std::future::Future<Output = Result<Vec<UnitObject>>> + Send;

    /// Create a unit. Fails with an already-exists error if the name is taken.
    fn create_unit(
        &self,
        namespace: &str,
        unit: &DesiredUnit,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Update the mutable fields of a unit, guarded by `resource_version`.
    fn update_unit(
        &self,
        namespace: &str,
        unit: &DesiredUnit,
        resource_version: Option<&str>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Delete a unit.
    fn delete_unit(
        &self,
        namespace: &str,
        key: &UnitKey,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<RayCluster>>> + Send;

    /// Clusters whose controller owner is `owner`.
    fn list_owned_clusters(
        &self,
        owner: &OwnerIdentity,
    ) -> impl std::future::Future<Output = Result<Vec<RayCluster>>> + Send;

    fn create_cluster(
        &self,
        cluster: &RayCluster,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn delete_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Overwrite the status of a cluster, guarded by `resource_version`.
    fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &RayClusterStatus,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Add or remove [`CLUSTER_FINALIZER`].
    fn set_cluster_finalizer(
        &self,
        namespace: &str,
        name: &str,
        present: bool,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<RayService>>> + Send;

    fn patch_service_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &RayServiceStatus,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn get_job(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<RayJob>>> + Send;

    fn patch_job_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &RayJobStatus,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Keys of every managed resource of `kind`, for the resync sweep.
    fn list_keys(
        &self,
        kind: OwnerKind,
    ) -> impl std::future::Future<Output = Result<Vec<ObjectKey>>> + Send;

    /// Publish an event. Failures are logged, never returned.
    fn record_event(&self, event: EventRecord) -> impl std::future::Future<Output = ()> + Send;
}
