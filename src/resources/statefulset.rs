//! StatefulSet for MongoDB replica set members
//!
//! The StatefulSet uses the `OnDelete` update strategy: Kubernetes never
//! restarts members on its own, so the reconciler decides the roll order
//! (oldest first, primary stepped down first). Its replica count is driven
//! by the reconciler one member at a time rather than copied from the spec.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, ExecAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, VolumeMount, VolumeResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::core::ObjectMeta;

use crate::controller::normalize::ClusterSpec;
use crate::resources::common::{
    CLUSTER_LABEL, MONGO_PORT, headless_service_name, owner_reference, selector_labels,
    standard_labels,
};

/// Name of the mongod container in member pods
pub const MONGO_CONTAINER: &str = "mongodb";

const DATA_VOLUME: &str = "data";
const DATA_PATH: &str = "/data/db";

/// Generate pod anti-affinity for spreading members across nodes and zones
fn generate_anti_affinity(cluster_name: &str) -> Affinity {
    let term = |weight: i32, topology_key: &str| WeightedPodAffinityTerm {
        weight,
        pod_affinity_term: PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: CLUSTER_LABEL.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![cluster_name.to_string()]),
                }]),
                ..Default::default()
            }),
            topology_key: topology_key.to_string(),
            ..Default::default()
        },
    };

    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                term(100, "kubernetes.io/hostname"),
                term(50, "topology.kubernetes.io/zone"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ping_probe(initial_delay: i32, failure_threshold: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "mongosh".to_string(),
                "--quiet".to_string(),
                "--eval".to_string(),
                "db.adminCommand('ping')".to_string(),
            ]),
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

/// Resource limits for the mongod container; requests equal limits
pub fn resource_limits(spec: &ClusterSpec) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(spec.cpu_limit.clone())),
        ("memory".to_string(), Quantity(spec.memory_limit.clone())),
    ])
}

/// Generate the member StatefulSet with the given replica count
pub fn generate_statefulset(
    spec: &ClusterSpec,
    image: &str,
    storage_size: &str,
    replicas: i32,
) -> StatefulSet {
    let labels = standard_labels(&spec.name);
    let limits = resource_limits(spec);

    let container = Container {
        name: MONGO_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["mongod".to_string()]),
        args: Some(vec![
            "--replSet".to_string(),
            spec.name.clone(),
            "--bind_ip_all".to_string(),
            "--port".to_string(),
            MONGO_PORT.to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: MONGO_PORT,
            name: Some("mongodb".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_PATH.to_string(),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            limits: Some(limits.clone()),
            requests: Some(limits),
            ..Default::default()
        }),
        startup_probe: Some(ping_probe(5, 30)),
        readiness_probe: Some(ping_probe(5, 3)),
        liveness_probe: Some(ping_probe(30, 6)),
        ..Default::default()
    };

    let pvc_template = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage_size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(spec)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: Some(headless_service_name(&spec.name)),
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&spec.name)),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                rolling_update: None,
            }),
            pod_management_policy: Some("OrderedReady".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    termination_grace_period_seconds: Some(30),
                    affinity: Some(generate_anti_affinity(&spec.name)),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![pvc_template]),
            persistent_volume_claim_retention_policy: Some(
                StatefulSetPersistentVolumeClaimRetentionPolicy {
                    when_deleted: Some("Retain".to_string()),
                    when_scaled: Some("Retain".to_string()),
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}
