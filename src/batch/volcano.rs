//! Volcano gang scheduling.
//!
//! Emits a `scheduling.volcano.sh/v1beta1` PodGroup whose `minMember` covers
//! the head plus every worker group's minimum, and routes Pods to the
//! `volcano` scheduler with a group-name annotation.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use kube::core::{ApiResource, GroupVersionKind};
use serde::{Deserialize, Serialize};

use crate::controller::error::{Error, Result};
use crate::crd::{GangSchedulingSpec, RayCluster};
use crate::resources::common::placement_group_name;
use crate::resources::units::PlacementGroup;

use super::BatchScheduler;

pub const VOLCANO_SCHEDULER_NAME: &str = "volcano";
pub const POD_GROUP_API_VERSION: &str = "scheduling.volcano.sh/v1beta1";
pub const POD_GROUP_KIND: &str = "PodGroup";
pub const GROUP_NAME_ANNOTATION: &str = "scheduling.k8s.io/group-name";
pub const QUEUE_LABEL: &str = "volcano.sh/queue-name";

const DEFAULT_QUEUE: &str = "default";

/// Dynamic API resource of the Volcano PodGroup.
pub fn pod_group_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("scheduling.volcano.sh", "v1beta1", POD_GROUP_KIND);
    ApiResource::from_gvk_with_plural(&gvk, "podgroups")
}

/// Volcano PodGroup spec.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupSpec {
    pub min_member: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

/// Volcano batch scheduler plugin.
#[derive(Debug, Default, Clone, Copy)]
pub struct VolcanoScheduler;

impl VolcanoScheduler {
    fn queue(policy: &GangSchedulingSpec) -> &str {
        policy.queue.as_deref().unwrap_or(DEFAULT_QUEUE)
    }

    /// Head plus the sum of worker minimums.
    pub fn min_member(cluster: &RayCluster) -> i32 {
        1 + cluster.spec.min_workers()
    }
}

impl BatchScheduler for VolcanoScheduler {
    fn name(&self) -> &'static str {
        VOLCANO_SCHEDULER_NAME
    }

    fn placement_unit(
        &self,
        cluster: &RayCluster,
        policy: &GangSchedulingSpec,
    ) -> Result<Option<PlacementGroup>> {
        let invalid = |reason: String| Error::InvalidSchedulerPolicy {
            policy: VOLCANO_SCHEDULER_NAME.to_string(),
            reason,
        };

        if Self::queue(policy).trim().is_empty() {
            return Err(invalid("queue name must not be empty".to_string()));
        }
        let min_member = Self::min_member(cluster);
        let total = 1 + cluster.spec.desired_workers();
        if min_member > total {
            return Err(invalid(format!(
                "minMember {} exceeds the {} desired pods",
                min_member, total
            )));
        }

        let spec = PodGroupSpec {
            min_member,
            queue: Some(Self::queue(policy).to_string()),
            priority_class_name: policy.priority_class_name.clone(),
        };

        Ok(Some(PlacementGroup {
            api_version: POD_GROUP_API_VERSION.to_string(),
            kind: POD_GROUP_KIND.to_string(),
            metadata: ObjectMeta {
                name: Some(placement_group_name(&cluster.name_any())),
                ..Default::default()
            },
            spec: serde_json::to_value(spec)?,
            status: None,
        }))
    }

    fn annotate(&self, pod: &mut Pod, cluster: &RayCluster, policy: &GangSchedulingSpec) {
        pod.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(
                GROUP_NAME_ANNOTATION.to_string(),
                placement_group_name(&cluster.name_any()),
            );
        pod.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(QUEUE_LABEL.to_string(), Self::queue(policy).to_string());
        if let Some(spec) = pod.spec.as_mut() {
            spec.scheduler_name = Some(VOLCANO_SCHEDULER_NAME.to_string());
            if let Some(priority) = &policy.priority_class_name {
                spec.priority_class_name = Some(priority.clone());
            }
        }
    }
}
