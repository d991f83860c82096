//! PodDisruptionBudget for replica set members
//!
//! Voluntary disruptions are limited to one member at a time, matching the
//! reconciler's own one-at-a-time rolling restarts.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::controller::normalize::ClusterSpec;
use crate::resources::common::{owner_reference, selector_labels, standard_labels};

/// Generate a PodDisruptionBudget for the cluster
pub fn generate_pdb(spec: &ClusterSpec) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(format!("{}-pdb", spec.name)),
            namespace: Some(spec.namespace.clone()),
            labels: Some(standard_labels(&spec.name)),
            owner_references: Some(vec![owner_reference(spec)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(&spec.name)),
                ..Default::default()
            }),
            // Use IfHealthyBudget to allow eviction if pod is unhealthy
            unhealthy_pod_eviction_policy: Some("IfHealthyBudget".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
