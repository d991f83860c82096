//! Unit tests for generated Kubernetes resources and member discovery

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateRunning, ContainerStatus, Pod, PodSpec, PodStatus,
    ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use mongo_operator::controller::backend::{MemberRole, ReplicaSetMember, ReplicaSetStatus};
use mongo_operator::controller::normalize::ClusterSpec;
use mongo_operator::resources::common::{
    member_endpoint, member_name, member_ordinal, selector_string,
};
use mongo_operator::resources::members::{member_from_pod, merge_replica_set_status};
use mongo_operator::resources::pdb::generate_pdb;
use mongo_operator::resources::secret::generate_admin_secret;
use mongo_operator::resources::service::{generate_client_service, generate_headless_service};
use mongo_operator::resources::statefulset::{MONGO_CONTAINER, generate_statefulset};

use crate::common::*;

fn spec() -> ClusterSpec {
    test_spec(
        &MongoClusterBuilder::new("mongo", "prod")
            .with_limits("2", "4Gi")
            .build(),
    )
}

fn running_pod(name: &str, cpu: &str, memory: &str) -> Pod {
    let limits = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ]);
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: MONGO_CONTAINER.to_string(),
                resources: Some(ResourceRequirements {
                    limits: Some(limits),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: MONGO_CONTAINER.to_string(),
                state: Some(ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

mod naming_tests {
    use super::*;

    #[test]
    fn test_member_names_and_endpoints() {
        assert_eq!(member_name("mongo", 2), "mongo-2");
        assert_eq!(
            member_endpoint("mongo", "prod", 0),
            "mongo-0.mongo.prod.svc.cluster.local:27017"
        );
    }

    #[test]
    fn test_member_ordinal_parsing() {
        assert_eq!(member_ordinal("mongo", "mongo-3"), Some(3));
        assert_eq!(member_ordinal("mongo", "mongo-backup-0"), None);
        assert_eq!(member_ordinal("mongo", "other-1"), None);
        assert_eq!(member_ordinal("mongo", "mongo"), None);
    }

    #[test]
    fn test_selector_string() {
        let selector = selector_string("mongo");
        assert!(selector.contains("app.kubernetes.io/name=mongo"));
        assert!(selector.contains("operators.ultimaker.com/cluster=mongo"));
    }
}

mod statefulset_tests {
    use super::*;

    #[test]
    fn test_statefulset_uses_on_delete_and_given_replicas() {
        let sts = generate_statefulset(&spec(), "mongo:4.0", "10Gi", 4);
        let sts_spec = sts.spec.unwrap();

        assert_eq!(sts.metadata.name.as_deref(), Some("mongo"));
        assert_eq!(sts_spec.replicas, Some(4));
        assert_eq!(
            sts_spec.update_strategy.unwrap().type_.as_deref(),
            Some("OnDelete")
        );
        assert_eq!(sts_spec.service_name.as_deref(), Some("mongo"));
        assert_eq!(
            sts_spec.volume_claim_templates.unwrap()[0]
                .spec
                .as_ref()
                .unwrap()
                .resources
                .as_ref()
                .unwrap()
                .requests
                .as_ref()
                .unwrap()["storage"],
            Quantity("10Gi".to_string())
        );
    }

    #[test]
    fn test_container_limits_and_replica_set_name() {
        let sts = generate_statefulset(&spec(), "mongo:4.0", "10Gi", 3);
        let pod_spec = sts.spec.unwrap().template.spec.unwrap();
        let container = &pod_spec.containers[0];

        assert_eq!(container.name, MONGO_CONTAINER);
        assert_eq!(container.image.as_deref(), Some("mongo:4.0"));
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["cpu"], Quantity("2".to_string()));
        assert_eq!(limits["memory"], Quantity("4Gi".to_string()));

        let args = container.args.as_ref().unwrap();
        let repl_set = args.iter().position(|a| a == "--replSet").unwrap();
        assert_eq!(args[repl_set + 1], "mongo");
    }

    #[test]
    fn test_owner_reference_points_at_cluster() {
        let sts = generate_statefulset(&spec(), "mongo:4.0", "10Gi", 3);
        let owner = &sts.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "MongoCluster");
        assert_eq!(owner.uid, TEST_UID);
        assert_eq!(owner.controller, Some(true));
    }
}

mod service_tests {
    use super::*;

    #[test]
    fn test_headless_service_publishes_unready_members() {
        let svc = generate_headless_service(&spec());
        let svc_spec = svc.spec.unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("mongo"));
        assert_eq!(svc_spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(svc_spec.publish_not_ready_addresses, Some(true));
    }

    #[test]
    fn test_client_service() {
        let svc = generate_client_service(&spec());
        let svc_spec = svc.spec.unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("mongo-client"));
        assert_eq!(svc_spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(svc_spec.ports.unwrap()[0].port, 27017);
    }

    #[test]
    fn test_pdb_allows_one_unavailable() {
        let pdb = generate_pdb(&spec());
        assert_eq!(pdb.metadata.name.as_deref(), Some("mongo-pdb"));
        assert_eq!(pdb.spec.unwrap().max_unavailable, Some(IntOrString::Int(1)));
    }

    #[test]
    fn test_admin_secret() {
        let secret = generate_admin_secret(&spec());
        let data = secret.string_data.unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("mongo-admin-credentials"));
        assert_eq!(data["username"], "root");
        assert_eq!(data["password"].len(), 32);
        assert_ne!(data["password"], generate_admin_secret(&spec()).string_data.unwrap()["password"]);
    }
}

mod member_discovery_tests {
    use super::*;

    #[test]
    fn test_member_from_running_pod() {
        let member = member_from_pod(&spec(), &running_pod("mongo-1", "2", "4Gi")).unwrap();
        assert_eq!(member.ordinal, 1);
        assert!(member.running);
        assert!(!member.joined);
        assert!(member.has_limits("2", "4Gi"));
        assert_eq!(member.endpoint, "mongo-1.mongo.prod.svc.cluster.local:27017");
    }

    #[test]
    fn test_terminating_pod_is_not_running() {
        let mut pod = running_pod("mongo-0", "2", "4Gi");
        pod.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(at(3, 0)),
        );
        assert!(!member_from_pod(&spec(), &pod).unwrap().running);
    }

    #[test]
    fn test_foreign_pod_is_ignored() {
        assert!(member_from_pod(&spec(), &running_pod("mongo-backup", "1", "2Gi")).is_none());
    }

    #[test]
    fn test_merge_marks_joined_members_and_primary() {
        let spec = spec();
        let members = (0..3)
            .map(|i| {
                member_from_pod(&spec, &running_pod(&format!("mongo-{}", i), "2", "4Gi")).unwrap()
            })
            .collect();
        let rs = ReplicaSetStatus {
            initiated: true,
            members: vec![
                ReplicaSetMember {
                    host: member_endpoint("mongo", "prod", 0),
                    role: MemberRole::Secondary,
                },
                ReplicaSetMember {
                    host: member_endpoint("mongo", "prod", 1),
                    role: MemberRole::Primary,
                },
            ],
        };

        let state = merge_replica_set_status(members, &rs);

        assert_eq!(state.primary.as_deref(), Some("mongo-1"));
        assert_eq!(state.healthy_count(), 2);
        assert!(state.members[0].joined);
        assert!(!state.members[2].joined);
        assert!(!state.members[2].healthy);
    }
}
