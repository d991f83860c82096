//! Services for MongoDB replica sets
//!
//! The headless service gives every member a stable DNS name and exists from
//! the first reconcile. The client service is created only when traffic is
//! admitted, after any configured restore has completed.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec as K8sServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::controller::normalize::ClusterSpec;
use crate::resources::common::{
    MONGO_PORT, headless_service_name, owner_reference, selector_labels, standard_labels,
};

fn mongo_port() -> ServicePort {
    ServicePort {
        port: MONGO_PORT,
        target_port: Some(IntOrString::Int(MONGO_PORT)),
        name: Some("mongodb".to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Generate the headless service used for member discovery
///
/// Unready members are published so they can be reached while they join.
pub fn generate_headless_service(spec: &ClusterSpec) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(headless_service_name(&spec.name)),
            namespace: Some(spec.namespace.clone()),
            labels: Some(standard_labels(&spec.name)),
            owner_references: Some(vec![owner_reference(spec)]),
            ..Default::default()
        },
        spec: Some(K8sServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector_labels(&spec.name)),
            ports: Some(vec![mongo_port()]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn client_service_name(cluster_name: &str) -> String {
    format!("{}-client", cluster_name)
}

/// Generate the client service that admits application traffic
pub fn generate_client_service(spec: &ClusterSpec) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(client_service_name(&spec.name)),
            namespace: Some(spec.namespace.clone()),
            labels: Some(standard_labels(&spec.name)),
            owner_references: Some(vec![owner_reference(spec)]),
            ..Default::default()
        },
        spec: Some(K8sServiceSpec {
            selector: Some(selector_labels(&spec.name)),
            ports: Some(vec![mongo_port()]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
