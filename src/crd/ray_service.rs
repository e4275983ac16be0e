//! RayService Custom Resource Definition.
//!
//! A RayService keeps one serving RayCluster behind a stable serve endpoint
//! and swaps in a freshly built cluster whenever the cluster template changes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ray_cluster::{Condition, RayClusterSpec};

/// RayService is a custom resource for zero-downtime Ray Serve deployments.
///
/// Example:
/// ```yaml
/// apiVersion: ray.io/v1alpha1
/// kind: RayService
/// metadata:
///   name: rayservice-sample
/// spec:
///   clusterRetentionSeconds: 60
///   serveService:
///     port: 8000
///   rayClusterConfig:
///     headGroupSpec:
///       template:
///         image: rayproject/ray:2.9.0
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ray.io",
    version = "v1alpha1",
    kind = "RayService",
    plural = "rayservices",
    shortname = "rsvc",
    status = "RayServiceStatus",
    namespaced,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.serviceStatus"}"#,
    printcolumn = r#"{"name":"Active", "type":"string", "jsonPath":".status.activeServiceStatus.clusterName"}"#,
    printcolumn = r#"{"name":"Pending", "type":"string", "jsonPath":".status.pendingServiceStatus.clusterName"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RayServiceSpec {
    /// Template for the serving cluster. Any change triggers a blue/green swap.
    pub ray_cluster_config: RayClusterSpec,

    /// Shared serve endpoint.
    #[serde(default)]
    pub serve_service: ServeServiceSpec,

    /// How long a replaced cluster is kept before teardown.
    /// Falls back to the operator default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_retention_seconds: Option<i64>,
}

/// Serve endpoint that is repointed between clusters.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServeServiceSpec {
    #[serde(default = "default_serve_port")]
    pub port: i32,

    #[serde(default = "default_serve_port_name")]
    pub port_name: String,

    #[serde(default = "default_serve_service_type")]
    pub service_type: String,
}

impl Default for ServeServiceSpec {
    fn default() -> Self {
        Self {
            port: default_serve_port(),
            port_name: default_serve_port_name(),
            service_type: default_serve_service_type(),
        }
    }
}

fn default_serve_port() -> i32 {
    8000
}

fn default_serve_port_name() -> String {
    "serve".to_string()
}

fn default_serve_service_type() -> String {
    "ClusterIP".to_string()
}

/// Status of a RayService.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayServiceStatus {
    #[serde(default)]
    pub service_status: ServicePhase,

    /// Cluster currently behind the serve endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_service_status: Option<ServiceClusterStatus>,

    /// Cluster being prepared to take over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_service_status: Option<ServiceClusterStatus>,

    /// Replaced clusters waiting out their retention period.
    #[serde(default)]
    pub retiring_clusters: Vec<RetiringCluster>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

/// Cluster name together with the template fingerprint it was built from.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClusterStatus {
    pub cluster_name: String,
    pub fingerprint: String,
}

/// A previously active cluster scheduled for deletion.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetiringCluster {
    pub cluster_name: String,
    /// RFC 3339 timestamp after which the cluster is deleted.
    pub delete_after: String,
}

/// Serving state of a RayService.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ServicePhase {
    /// No cluster is serving yet.
    #[default]
    Pending,
    /// A target cluster is converging while the active one keeps serving.
    WaitingForTarget,
    /// The serve endpoint is being repointed.
    Swapping,
    /// The active cluster matches the template.
    Running,
}

impl std::fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServicePhase::Pending => write!(f, "Pending"),
            ServicePhase::WaitingForTarget => write!(f, "WaitingForTarget"),
            ServicePhase::Swapping => write!(f, "Swapping"),
            ServicePhase::Running => write!(f, "Running"),
        }
    }
}
