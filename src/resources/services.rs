//! Service generation for Ray clusters and services.
//!
//! Creates three kinds of endpoint:
//! - **Head Service**: GCS, dashboard, client and serve ports of the head Pod
//! - **Extra endpoints**: one Service per declared endpoint requirement
//! - **Serve Service**: the RayService endpoint whose selector is repointed on swap

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::{EndpointSpec, RayClusterSpec, ServeServiceSpec};

use super::common::{
    LABEL_CLUSTER, endpoint_service_name, head_service_name, pod_selector_labels,
    serve_service_name,
};
use super::pods::head_ports;

/// Generate the head Service of a cluster.
pub fn head_service(cluster: &str, spec: &RayClusterSpec) -> Service {
    let ports = head_ports(&spec.head_group_spec.template)
        .into_iter()
        .map(|(name, port)| tcp_port(name, port, port))
        .collect();
    build_service(
        head_service_name(cluster),
        cluster,
        &spec.head_group_spec.service_type,
        ports,
    )
}

/// Generate an extra endpoint Service pointing at the head Pod.
pub fn endpoint_service(cluster: &str, endpoint: &EndpointSpec) -> Service {
    let target = endpoint.target_port.unwrap_or(endpoint.port);
    build_service(
        endpoint_service_name(cluster, &endpoint.name),
        cluster,
        &endpoint.service_type,
        vec![tcp_port(endpoint.name.clone(), endpoint.port, target)],
    )
}

/// Generate the serve Service of a RayService pointing at `cluster`.
///
/// Only the selector depends on the cluster, so a swap is one update.
pub fn serve_service(service: &str, cluster: &str, serve: &ServeServiceSpec) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(serve_service_name(service)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(serve.service_type.clone()),
            selector: Some(pod_selector_labels(cluster, "head")),
            ports: Some(vec![tcp_port(serve.port_name.clone(), serve.port, serve.port)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Cluster currently selected by a serve Service.
pub fn selected_cluster(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()?
        .selector
        .as_ref()?
        .get(LABEL_CLUSTER)
        .map(String::as_str)
}

fn tcp_port(name: String, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name),
        port,
        target_port: Some(IntOrString::Int(target)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn build_service(name: String, cluster: &str, service_type: &str, ports: Vec<ServicePort>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(
                [(LABEL_CLUSTER.to_string(), cluster.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(pod_selector_labels(cluster, "head")),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}
