//! Pod generation for Ray head and worker nodes.
//!
//! Each Pod runs `ray start` with the group's start parameters. Workers join
//! the head through the head Service's cluster DNS name.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{ContainerTemplate, RayClusterSpec, ResourceRequirementsSpec, WorkerGroupSpec};

use super::common::{
    DEFAULT_CLIENT_PORT, DEFAULT_DASHBOARD_PORT, DEFAULT_GCS_PORT, DEFAULT_SERVE_PORT,
    LABEL_CLUSTER, head_pod_name, head_service_fqdn,
};

/// Name of the Ray container in every Pod.
pub const RAY_CONTAINER_NAME: &str = "ray-node";
/// Name of the autoscaler sidecar in the head Pod.
pub const AUTOSCALER_CONTAINER_NAME: &str = "autoscaler";

/// Ports exposed by the head when its template declares none.
pub fn default_head_ports() -> Vec<(String, i32)> {
    vec![
        ("gcs".to_string(), DEFAULT_GCS_PORT),
        ("dashboard".to_string(), DEFAULT_DASHBOARD_PORT),
        ("client".to_string(), DEFAULT_CLIENT_PORT),
        ("serve".to_string(), DEFAULT_SERVE_PORT),
    ]
}

/// Named ports of the head container.
pub fn head_ports(template: &ContainerTemplate) -> Vec<(String, i32)> {
    if template.ports.is_empty() {
        default_head_ports()
    } else {
        template
            .ports
            .iter()
            .map(|p| (p.name.clone(), p.container_port))
            .collect()
    }
}

/// GCS port from the head start parameters.
pub fn gcs_port(spec: &RayClusterSpec) -> i32 {
    spec.head_group_spec
        .ray_start_params
        .get("port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_GCS_PORT)
}

/// Generate the head Pod of a cluster.
pub fn head_pod(cluster: &str, namespace: &str, spec: &RayClusterSpec) -> Pod {
    let head = &spec.head_group_spec;
    let port = gcs_port(spec);

    let mut params = head.ray_start_params.clone();
    params.entry("dashboard-host".to_string()).or_insert_with(|| "0.0.0.0".to_string());
    params.insert("port".to_string(), port.to_string());
    let start = format!("ulimit -n 65536; ray start --head --block{}", start_flags(&params));

    let env = vec![
        env_var("RAY_CLUSTER_NAME", cluster),
        env_var("RAY_PORT", &port.to_string()),
    ];
    let mut container = ray_container(&head.template, start, env);
    container.ports = Some(
        head_ports(&head.template)
            .into_iter()
            .map(|(name, container_port)| ContainerPort {
                name: Some(name),
                container_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect(),
    );

    let mut containers = vec![container];
    if spec.enable_in_tree_autoscaling {
        containers.push(autoscaler_container(cluster, namespace, &head.template));
    }

    build_pod(head_pod_name(cluster), cluster, &head.template, containers)
}

/// Generate one worker Pod of a group.
pub fn worker_pod(
    name: String,
    cluster: &str,
    namespace: &str,
    spec: &RayClusterSpec,
    group: &WorkerGroupSpec,
) -> Pod {
    let address = format!("{}:{}", head_service_fqdn(cluster, namespace), gcs_port(spec));
    let start = format!(
        "ulimit -n 65536; ray start --block --address={}{}",
        address,
        start_flags(&group.ray_start_params)
    );
    let env = vec![
        env_var("RAY_CLUSTER_NAME", cluster),
        env_var("RAY_IP", &head_service_fqdn(cluster, namespace)),
        env_var("RAY_PORT", &gcs_port(spec).to_string()),
    ];
    let mut container = ray_container(&group.template, start, env);
    if !group.template.ports.is_empty() {
        container.ports = Some(
            group
                .template
                .ports
                .iter()
                .map(|p| ContainerPort {
                    name: Some(p.name.clone()),
                    container_port: p.container_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
                .collect(),
        );
    }

    build_pod(name, cluster, &group.template, vec![container])
}

/// `--key=value` flags in key order, each prefixed with a space.
fn start_flags(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!(" --{}={}", k, v))
        .collect()
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn ray_container(template: &ContainerTemplate, start: String, mut env: Vec<EnvVar>) -> Container {
    env.extend(template.env.iter().map(|(k, v)| env_var(k, v)));

    let command = if template.command.is_empty() {
        vec!["/bin/bash".to_string(), "-lc".to_string(), "--".to_string()]
    } else {
        template.command.clone()
    };
    let args = if template.args.is_empty() {
        vec![start]
    } else {
        template.args.clone()
    };

    Container {
        name: RAY_CONTAINER_NAME.to_string(),
        image: Some(template.image.clone()),
        image_pull_policy: template.image_pull_policy.clone(),
        command: Some(command),
        args: Some(args),
        env: Some(env),
        resources: resource_requirements(&template.resources),
        ..Default::default()
    }
}

fn autoscaler_container(cluster: &str, namespace: &str, template: &ContainerTemplate) -> Container {
    Container {
        name: AUTOSCALER_CONTAINER_NAME.to_string(),
        image: Some(template.image.clone()),
        image_pull_policy: template.image_pull_policy.clone(),
        command: Some(vec!["ray".to_string()]),
        args: Some(vec![
            "kuberay-autoscaler".to_string(),
            "--cluster-name".to_string(),
            cluster.to_string(),
            "--cluster-namespace".to_string(),
            namespace.to_string(),
        ]),
        env: Some(vec![env_var("RAY_CLUSTER_NAME", cluster)]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("500m".to_string())),
                ("memory".to_string(), Quantity("512Mi".to_string())),
            ])),
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("500m".to_string())),
                ("memory".to_string(), Quantity("512Mi".to_string())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Convert string quantities into platform resource requirements.
pub fn resource_requirements(spec: &ResourceRequirementsSpec) -> Option<ResourceRequirements> {
    if spec.is_empty() {
        return None;
    }
    let convert = |m: &BTreeMap<String, String>| {
        (!m.is_empty()).then(|| {
            m.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect::<BTreeMap<_, _>>()
        })
    };
    Some(ResourceRequirements {
        requests: convert(&spec.requests),
        limits: convert(&spec.limits),
        ..Default::default()
    })
}

fn build_pod(
    name: String,
    cluster: &str,
    template: &ContainerTemplate,
    containers: Vec<Container>,
) -> Pod {
    let mut labels = template.labels.clone();
    labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels),
            annotations: (!template.annotations.is_empty()).then(|| template.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            restart_policy: Some("Always".to_string()),
            node_selector: (!template.node_selector.is_empty())
                .then(|| template.node_selector.clone()),
            service_account_name: template.service_account_name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::crd::{ContainerPortSpec, HeadGroupSpec};

    fn spec() -> RayClusterSpec {
        RayClusterSpec {
            head_group_spec: HeadGroupSpec {
                template: ContainerTemplate {
                    image: "rayproject/ray:2.9.0".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
            worker_group_specs: vec![WorkerGroupSpec {
                group_name: "small".into(),
                replicas: 1,
                max_replicas: 3,
                template: ContainerTemplate {
                    image: "rayproject/ray:2.9.0".into(),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_head_pod_defaults() {
        let pod = head_pod("demo", "ml", &spec());
        assert_eq!(pod.metadata.name.as_deref(), Some("demo-head"));
        let pod_spec = pod.spec.unwrap();
        assert_eq!(pod_spec.containers.len(), 1);
        let container = &pod_spec.containers[0];
        let args = container.args.as_ref().unwrap();
        assert!(args[0].contains("ray start --head --block"));
        assert!(args[0].contains("--dashboard-host=0.0.0.0"));
        assert!(args[0].contains("--port=6379"));
        assert_eq!(container.ports.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn test_head_pod_autoscaler_sidecar() {
        let mut spec = spec();
        spec.enable_in_tree_autoscaling = true;
        let pod = head_pod("demo", "ml", &spec);
        let containers = pod.spec.unwrap().containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1].name, AUTOSCALER_CONTAINER_NAME);
        assert!(containers[1].args.as_ref().unwrap().contains(&"ml".to_string()));
    }

    #[test]
    fn test_worker_pod_joins_head_service() {
        let spec = spec();
        let group = &spec.worker_group_specs[0];
        let pod = worker_pod("demo-small-worker-0".into(), "demo", "ml", &spec, group);
        let container = &pod.spec.unwrap().containers[0];
        assert!(
            container.args.as_ref().unwrap()[0]
                .contains("--address=demo-head-svc.ml.svc.cluster.local:6379")
        );
        assert!(container.ports.is_none());
    }

    #[test]
    fn test_custom_head_ports_and_gcs_port() {
        let mut spec = spec();
        spec.head_group_spec.template.ports = vec![ContainerPortSpec {
            name: "gcs".into(),
            container_port: 6380,
        }];
        spec.head_group_spec
            .ray_start_params
            .insert("port".into(), "6380".into());
        assert_eq!(gcs_port(&spec), 6380);
        assert_eq!(head_ports(&spec.head_group_spec.template), vec![("gcs".to_string(), 6380)]);
    }

    #[test]
    fn test_resource_requirements_conversion() {
        let mut resources = ResourceRequirementsSpec::default();
        assert!(resource_requirements(&resources).is_none());
        resources.limits.insert("cpu".into(), "2".into());
        let converted = resource_requirements(&resources).unwrap();
        assert!(converted.requests.is_none());
        assert_eq!(converted.limits.unwrap()["cpu"], Quantity("2".into()));
    }
}
