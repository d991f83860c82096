//! Common utilities for Kubernetes resource generation
//!
//! Shared constants, owner references and labels used by every generator.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::controller::normalize::ClusterSpec;

/// API version for the MongoCluster CRD
pub const API_VERSION: &str = "operators.ultimaker.com/v1";

/// Kind for the MongoCluster CRD
pub const KIND: &str = "MongoCluster";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "mongo-operator";

/// Label carrying the owning cluster name
pub const CLUSTER_LABEL: &str = "operators.ultimaker.com/cluster";

/// Port mongod listens on
pub const MONGO_PORT: i32 = 27017;

/// Generate an owner reference for a MongoCluster
///
/// All child resources are owned by the cluster and garbage collected with it.
pub fn owner_reference(spec: &ClusterSpec) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: spec.name.clone(),
        uid: spec.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Generate standard labels for all resources belonging to a MongoCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "mongodb".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels selecting the member pods of a cluster
pub fn selector_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            cluster_name.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Label selector string for listing member pods
pub fn selector_string(cluster_name: &str) -> String {
    selector_labels(cluster_name)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Name of the headless service, also the StatefulSet service name
pub fn headless_service_name(cluster_name: &str) -> String {
    cluster_name.to_string()
}

/// Name of the member pod with the given ordinal
pub fn member_name(cluster_name: &str, ordinal: i32) -> String {
    format!("{}-{}", cluster_name, ordinal)
}

/// Stable `host:port` of a member, as used in the replica set configuration
pub fn member_endpoint(cluster_name: &str, namespace: &str, ordinal: i32) -> String {
    format!(
        "{}.{}.{}.svc.cluster.local:{}",
        member_name(cluster_name, ordinal),
        headless_service_name(cluster_name),
        namespace,
        MONGO_PORT
    )
}

/// Ordinal of a member pod name, e.g. 2 for `mongo-2`
pub fn member_ordinal(cluster_name: &str, pod_name: &str) -> Option<i32> {
    pod_name
        .strip_prefix(cluster_name)?
        .strip_prefix('-')?
        .parse()
        .ok()
}
