//! RayCluster Custom Resource Definition.
//!
//! A RayCluster declares one head group and any number of worker groups.
//! The operator turns it into a head Pod, indexed worker Pods, endpoint
//! Services and an optional gang-scheduling placement group.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// RayCluster is a custom resource for deploying Ray clusters.
///
/// Example:
/// ```yaml
/// apiVersion: ray.io/v1alpha1
/// kind: RayCluster
/// metadata:
///   name: raycluster-sample
/// spec:
///   rayVersion: "2.9.0"
///   headGroupSpec:
///     rayStartParams:
///       dashboard-host: "0.0.0.0"
///     template:
///       image: rayproject/ray:2.9.0
///   workerGroupSpecs:
///     - groupName: small-group
///       replicas: 2
///       minReplicas: 1
///       maxReplicas: 3
///       template:
///         image: rayproject/ray:2.9.0
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ray.io",
    version = "v1alpha1",
    kind = "RayCluster",
    plural = "rayclusters",
    shortname = "rc",
    status = "RayClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Desired Workers", "type":"integer", "jsonPath":".status.desiredWorkerReplicas"}"#,
    printcolumn = r#"{"name":"Ready Workers", "type":"integer", "jsonPath":".status.readyWorkerReplicas"}"#,
    printcolumn = r#"{"name":"Head IP", "type":"string", "jsonPath":".status.head.podIP"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterSpec {
    /// Ray version running in the cluster images. Informational only.
    #[serde(default)]
    pub ray_version: String,

    /// The head group. Exactly one head Pod is created from it.
    pub head_group_spec: HeadGroupSpec,

    /// Worker groups, each producing `replicas` worker Pods.
    #[serde(default)]
    pub worker_group_specs: Vec<WorkerGroupSpec>,

    /// Adds the in-tree autoscaler sidecar to the head Pod.
    #[serde(default)]
    pub enable_in_tree_autoscaling: bool,

    /// Gang-scheduling policy reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gang_scheduling: Option<GangSchedulingSpec>,
}

/// Head group template.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeadGroupSpec {
    /// Service type of the head endpoint (default: ClusterIP).
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Parameters passed to `ray start` as `--key=value`.
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    /// Container template for the head Pod.
    pub template: ContainerTemplate,

    /// Additional endpoints pointing at the head Pod.
    #[serde(default)]
    pub services: Vec<EndpointSpec>,
}

/// Worker group template.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroupSpec {
    /// Name of the group, unique within the cluster.
    pub group_name: String,

    /// Desired number of worker Pods.
    #[serde(default)]
    pub replicas: i32,

    /// Lower bound for `replicas`.
    #[serde(default)]
    pub min_replicas: i32,

    /// Upper bound for `replicas`.
    #[serde(default = "default_max_replicas")]
    pub max_replicas: i32,

    /// Parameters passed to `ray start` as `--key=value`.
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    /// Container template for the worker Pods.
    pub template: ContainerTemplate,

    /// Explicit scale-down targets chosen by the autoscaler.
    #[serde(default)]
    pub scale_strategy: ScaleStrategy,
}

/// Scale strategy for a worker group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleStrategy {
    /// Worker Pod names to remove when shrinking the group.
    #[serde(default)]
    pub workers_to_delete: Vec<String>,
}

/// Container template shared by head and worker groups.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTemplate {
    /// Container image (e.g., rayproject/ray:2.9.0).
    pub image: String,

    /// Image pull policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Overrides the container entrypoint.
    #[serde(default)]
    pub command: Vec<String>,

    /// Overrides the generated `ray start` arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Container ports.
    #[serde(default)]
    pub ports: Vec<ContainerPortSpec>,

    /// Resource requests and limits.
    #[serde(default)]
    pub resources: ResourceRequirementsSpec,

    /// Extra Pod labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Extra Pod annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Node selector for the Pod.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Service account for the Pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// A named container port.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPortSpec {
    pub name: String,
    pub container_port: i32,
}

/// Resource requests and limits keyed by resource name (cpu, memory, ...).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirementsSpec {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }
}

/// Additional endpoint pointing at the head Pod.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    /// Suffix of the Service name (`{cluster}-{name}`).
    pub name: String,

    /// Service port.
    pub port: i32,

    /// Target container port (default: same as `port`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,

    /// Service type (default: ClusterIP).
    #[serde(default = "default_service_type")]
    pub service_type: String,
}

/// Gang-scheduling policy reference.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GangSchedulingSpec {
    /// Registered batch scheduler name (e.g., "volcano").
    /// Falls back to the operator's default policy when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,

    /// Scheduler queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    /// Priority class for the placement group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

fn default_service_type() -> String {
    "ClusterIP".to_string()
}

fn default_max_replicas() -> i32 {
    i32::MAX
}

/// Status of a RayCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterStatus {
    /// Current phase of the cluster lifecycle.
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Per-group replica counts.
    #[serde(default)]
    pub worker_groups: Vec<WorkerGroupStatus>,

    #[serde(default)]
    pub desired_worker_replicas: i32,

    #[serde(default)]
    pub ready_worker_replicas: i32,

    #[serde(default)]
    pub min_worker_replicas: i32,

    #[serde(default)]
    pub max_worker_replicas: i32,

    /// Head Pod and head Service addresses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<HeadInfo>,

    /// Head endpoint ports keyed by port name.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,

    /// Fingerprint of the spec used by the last reconcile pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_fingerprint: Option<String>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Reconcile passes in a row that had at least one failed mutation.
    #[serde(default)]
    pub consecutive_failures: i32,

    /// Failed units that were replaced.
    #[serde(default)]
    pub unit_restarts: i32,

    /// Last convergence error, retained while Failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

/// Replica counts of one worker group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroupStatus {
    pub group_name: String,
    pub desired_replicas: i32,
    pub observed_replicas: i32,
    pub ready_replicas: i32,
}

/// Addresses of the head Pod and head Service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeadInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, rename = "podIP", skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, rename = "serviceIP", skip_serializing_if = "Option::is_none")]
    pub service_ip: Option<String>,
}

/// ClusterPhase represents the current lifecycle phase of a RayCluster.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ClusterPhase {
    /// No native units observed yet.
    #[default]
    Initializing,
    /// Units exist but are not all ready.
    Pending,
    /// Head ready and every worker group at its desired count.
    Running,
    /// A delete-then-create plan is in flight.
    Upgrading,
    /// A required unit has been unhealthy past the grace period.
    Degraded,
    /// Convergence failed repeatedly. Cleared by a spec change.
    Failed,
    /// Owner deletion in progress.
    Deleting,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Initializing => write!(f, "Initializing"),
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Upgrading => write!(f, "Upgrading"),
            ClusterPhase::Degraded => write!(f, "Degraded"),
            ClusterPhase::Failed => write!(f, "Failed"),
            ClusterPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Condition describes the state of a resource at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Ready.as_str(), ready, reason, message, generation)
    }

    /// Create a "Progressing" condition.
    pub fn progressing(
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new(
            ConditionType::Progressing.as_str(),
            progressing,
            reason,
            message,
            generation,
        )
    }

    /// Create a "Degraded" condition.
    pub fn degraded(degraded: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Degraded.as_str(), degraded, reason, message, generation)
    }

    /// Create a "SpecValid" condition.
    pub fn spec_valid(valid: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::SpecValid.as_str(), valid, reason, message, generation)
    }

    /// Create an "UpgradeBlocked" condition.
    pub fn upgrade_blocked(
        blocked: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new(
            ConditionType::UpgradeBlocked.as_str(),
            blocked,
            reason,
            message,
            generation,
        )
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Condition types written by the operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConditionType {
    /// Head ready and all worker groups at desired size.
    Ready,
    /// Units are being created, replaced or awaited.
    Progressing,
    /// A required unit is unhealthy past the grace period.
    Degraded,
    /// The spec resolved into units without configuration errors.
    SpecValid,
    /// The disruption guard is holding back recreates.
    UpgradeBlocked,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Progressing => "Progressing",
            ConditionType::Degraded => "Degraded",
            ConditionType::SpecValid => "SpecValid",
            ConditionType::UpgradeBlocked => "UpgradeBlocked",
        }
    }
}

impl RayClusterSpec {
    /// Sum of desired replicas over all worker groups.
    pub fn desired_workers(&self) -> i32 {
        self.worker_group_specs.iter().map(|g| g.replicas.max(0)).sum()
    }

    /// Sum of minimum replicas over all worker groups.
    pub fn min_workers(&self) -> i32 {
        self.worker_group_specs
            .iter()
            .map(|g| g.min_replicas.max(0))
            .sum()
    }

    /// Sum of maximum replicas, saturating at `i32::MAX`.
    pub fn max_workers(&self) -> i32 {
        self.worker_group_specs
            .iter()
            .fold(0i32, |acc, g| acc.saturating_add(g.max_replicas.max(0)))
    }
}
