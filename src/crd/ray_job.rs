//! RayJob Custom Resource Definition.
//!
//! A RayJob runs one entrypoint on an ephemeral cluster (or on an existing
//! cluster chosen by selector) and optionally tears the cluster down afterwards.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ray_cluster::{Condition, RayClusterSpec};

/// RayJob is a custom resource for one-shot Ray jobs.
///
/// Example:
/// ```yaml
/// apiVersion: ray.io/v1alpha1
/// kind: RayJob
/// metadata:
///   name: rayjob-sample
/// spec:
///   entrypoint: python /home/ray/samples/sample_code.py
///   shutdownAfterJobFinishes: true
///   ttlSecondsAfterFinished: 10
///   rayClusterSpec:
///     headGroupSpec:
///       template:
///         image: rayproject/ray:2.9.0
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ray.io",
    version = "v1alpha1",
    kind = "RayJob",
    plural = "rayjobs",
    shortname = "rj",
    status = "RayJobStatus",
    namespaced,
    printcolumn = r#"{"name":"Deployment", "type":"string", "jsonPath":".status.jobDeploymentStatus"}"#,
    printcolumn = r#"{"name":"Job", "type":"string", "jsonPath":".status.jobStatus"}"#,
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".status.rayClusterName"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RayJobSpec {
    /// Command submitted to the cluster.
    pub entrypoint: String,

    /// Runtime environment as a JSON document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_env: Option<String>,

    /// Metadata attached to the submission.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Submission id. Defaults to `{name}-{uid prefix}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Template of the ephemeral cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ray_cluster_spec: Option<RayClusterSpec>,

    /// Selects an existing cluster by its `ray.io/cluster` label instead.
    #[serde(default)]
    pub cluster_selector: BTreeMap<String, String>,

    /// Delete the ephemeral cluster once the job finishes.
    #[serde(default)]
    pub shutdown_after_job_finishes: bool,

    /// Delay between job completion and cluster teardown.
    #[serde(default)]
    pub ttl_seconds_after_finished: i32,
}

/// Status of a RayJob.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RayJobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ray_cluster_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,

    #[serde(default)]
    pub job_deployment_status: JobDeploymentStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Lifecycle of a RayJob.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum JobDeploymentStatus {
    #[default]
    PendingClusterCreation,
    ClusterReady,
    Submitted,
    Running,
    Succeeded,
    Failed,
    CleaningUp,
    Complete,
}

impl JobDeploymentStatus {
    /// Whether the job itself has reached an outcome.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobDeploymentStatus::Succeeded
                | JobDeploymentStatus::Failed
                | JobDeploymentStatus::CleaningUp
                | JobDeploymentStatus::Complete
        )
    }
}

impl std::fmt::Display for JobDeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobDeploymentStatus::PendingClusterCreation => write!(f, "PendingClusterCreation"),
            JobDeploymentStatus::ClusterReady => write!(f, "ClusterReady"),
            JobDeploymentStatus::Submitted => write!(f, "Submitted"),
            JobDeploymentStatus::Running => write!(f, "Running"),
            JobDeploymentStatus::Succeeded => write!(f, "Succeeded"),
            JobDeploymentStatus::Failed => write!(f, "Failed"),
            JobDeploymentStatus::CleaningUp => write!(f, "CleaningUp"),
            JobDeploymentStatus::Complete => write!(f, "Complete"),
        }
    }
}

/// Job state as reported by the Ray dashboard.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Stopped,
}
