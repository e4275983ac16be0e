//! Validation logic for RayCluster specs.
//!
//! Every violation is a configuration error: it is surfaced in the
//! `SpecValid` condition and not retried until the spec changes.

use std::collections::BTreeSet;

use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::crd::{ContainerTemplate, RayCluster, RayClusterSpec, WorkerGroupSpec};
use crate::resources::common::{endpoint_service_name, head_service_name, worker_pod_name};

/// Maximum cluster name length.
pub const MAX_NAME_LENGTH: usize = 40;

/// Maximum length of a unit name; unit names double as DNS labels and
/// hostnames.
pub const MAX_UNIT_NAME_LENGTH: usize = 63;

/// Validate the resource spec
pub fn validate_spec(resource: &RayCluster) -> Result<()> {
    validate_cluster_spec(&resource.name_any(), &resource.spec)
}

/// Validate a cluster template under the cluster name it will be created with.
///
/// RayService and RayJob pass the name they derive for their cluster, so a
/// parent whose derived name is too long is rejected on the parent.
pub fn validate_cluster_spec(name: &str, spec: &RayClusterSpec) -> Result<()> {
    validate_name_length(name)?;
    validate_template("headGroupSpec", &spec.head_group_spec.template)?;
    validate_worker_groups(name, spec)?;
    validate_endpoints(name, spec)?;
    Ok(())
}

fn validate_name_length(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "name '{}' exceeds maximum length of {} characters",
            name, MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

fn validate_unit_name(unit: &str, source: &str) -> Result<()> {
    if unit.len() > MAX_UNIT_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "{}: derived name '{}' exceeds maximum length of {} characters",
            source, unit, MAX_UNIT_NAME_LENGTH
        )));
    }
    Ok(())
}

/// Longest worker name the group's current replica count produces.
fn longest_worker_name(cluster: &str, group: &WorkerGroupSpec) -> String {
    let highest = usize::try_from(group.replicas.max(1) - 1).unwrap_or_default();
    let index = highest + group.scale_strategy.workers_to_delete.len();
    worker_pod_name(cluster, &group.group_name, index)
}

fn validate_template(path: &str, template: &ContainerTemplate) -> Result<()> {
    if template.image.trim().is_empty() {
        return Err(Error::Validation(format!("{}.template.image is required", path)));
    }
    for port in &template.ports {
        if !(1..=65535).contains(&port.container_port) {
            return Err(Error::Validation(format!(
                "{}.template.ports[{}]: port {} out of range",
                path, port.name, port.container_port
            )));
        }
    }
    Ok(())
}

fn validate_worker_groups(cluster: &str, spec: &RayClusterSpec) -> Result<()> {
    let mut seen = BTreeSet::new();
    for group in &spec.worker_group_specs {
        let name = group.group_name.as_str();
        if !is_dns_label(name) {
            return Err(Error::Validation(format!(
                "worker group name '{}' must be a lowercase DNS label",
                name
            )));
        }
        if !seen.insert(name) {
            return Err(Error::Validation(format!(
                "worker group name '{}' is not unique",
                name
            )));
        }
        if group.min_replicas < 0 {
            return Err(Error::Validation(format!(
                "worker group '{}': minReplicas cannot be negative",
                name
            )));
        }
        if group.min_replicas > group.max_replicas {
            return Err(Error::Validation(format!(
                "worker group '{}': minReplicas {} exceeds maxReplicas {}",
                name, group.min_replicas, group.max_replicas
            )));
        }
        if group.replicas < group.min_replicas || group.replicas > group.max_replicas {
            return Err(Error::Validation(format!(
                "worker group '{}': replicas {} outside [{}, {}]",
                name, group.replicas, group.min_replicas, group.max_replicas
            )));
        }
        validate_unit_name(
            &longest_worker_name(cluster, group),
            &format!("worker group '{}'", name),
        )?;
        validate_template(&format!("workerGroupSpecs[{}]", name), &group.template)?;
    }
    Ok(())
}

fn validate_endpoints(cluster: &str, spec: &RayClusterSpec) -> Result<()> {
    let mut seen = BTreeSet::from([head_service_name(cluster)]);
    for endpoint in &spec.head_group_spec.services {
        if !is_dns_label(&endpoint.name) {
            return Err(Error::Validation(format!(
                "endpoint name '{}' must be a lowercase DNS label",
                endpoint.name
            )));
        }
        if !(1..=65535).contains(&endpoint.port) {
            return Err(Error::Validation(format!(
                "endpoint '{}': port {} out of range",
                endpoint.name, endpoint.port
            )));
        }
        let service_name = endpoint_service_name(cluster, &endpoint.name);
        validate_unit_name(&service_name, &format!("endpoint '{}'", endpoint.name))?;
        if !seen.insert(service_name) {
            return Err(Error::Validation(format!(
                "endpoint '{}' collides with another endpoint of the cluster",
                endpoint.name
            )));
        }
    }
    Ok(())
}

/// Lowercase alphanumerics and '-', starting and ending alphanumeric.
fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}
