//! Member backend on top of the Kubernetes API
//!
//! Members are the pods of the cluster StatefulSet. Pod status tells whether a
//! member runs; the replica set status reported by mongod tells whether it has
//! joined and is healthy. The StatefulSet replica count is moved one member at
//! a time by the reconciler.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use tracing::{debug, info, warn};

use crate::controller::backend::{DatabaseShell, MemberBackend, ReplicaSetStatus};
use crate::controller::cluster_state::{ClusterState, Member};
use crate::controller::error::{Error, Result};
use crate::controller::normalize::ClusterSpec;
use crate::resources::common::{FIELD_MANAGER, member_endpoint, member_ordinal, selector_string};
use crate::resources::secret::{ADMIN_USERNAME, admin_secret_name};
use crate::resources::service::{client_service_name, generate_client_service};
use crate::resources::statefulset::MONGO_CONTAINER;

/// Build a member from its pod, before replica set membership is known
pub fn member_from_pod(spec: &ClusterSpec, pod: &Pod) -> Option<Member> {
    let name = pod.metadata.name.clone()?;
    let ordinal = member_ordinal(&spec.name, &name)?;

    let terminating = pod.metadata.deletion_timestamp.is_some();
    let status = pod.status.as_ref();
    let container_running = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.name == MONGO_CONTAINER))
        .and_then(|c| c.state.as_ref())
        .is_some_and(|s| s.running.is_some());
    let running = !terminating
        && status.and_then(|s| s.phase.as_deref()) == Some("Running")
        && container_running;

    let limits = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == MONGO_CONTAINER))
        .and_then(|c| c.resources.as_ref())
        .and_then(|r| r.limits.as_ref());

    Some(Member {
        endpoint: member_endpoint(&spec.name, &spec.namespace, ordinal),
        name,
        ordinal,
        running,
        joined: false,
        healthy: false,
        created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
        cpu_limit: limits.and_then(|l| l.get("cpu")).map(|q| q.0.clone()),
        memory_limit: limits.and_then(|l| l.get("memory")).map(|q| q.0.clone()),
    })
}

/// Combine pod-level members with the replica set view
pub fn merge_replica_set_status(members: Vec<Member>, rs: &ReplicaSetStatus) -> ClusterState {
    let primary_host = rs.primary_host();
    let mut primary = None;

    let members = members
        .into_iter()
        .map(|mut m| {
            if let Some(entry) = rs.member(&m.endpoint) {
                m.joined = true;
                m.healthy = m.running && entry.role.is_healthy();
            }
            if primary_host == Some(m.endpoint.as_str()) && m.running {
                primary = Some(m.name.clone());
            }
            m
        })
        .collect();

    ClusterState::new(members, primary)
}

pub struct KubeMemberBackend {
    client: Client,
    shell: Arc<dyn DatabaseShell>,
}

impl KubeMemberBackend {
    pub fn new(client: Client, shell: Arc<dyn DatabaseShell>) -> Self {
        Self { client, shell }
    }

    async fn scale(&self, spec: &ClusterSpec, replicas: i32) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &spec.namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(&spec.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(cluster = %spec.name, replicas, "scaled member set");
        Ok(())
    }

    /// First replica set status reported by an initiated member
    async fn replica_set_status(
        &self,
        spec: &ClusterSpec,
        members: &[Member],
    ) -> ReplicaSetStatus {
        for member in members.iter().filter(|m| m.running) {
            match self.shell.replica_set_status(&spec.namespace, member).await {
                Ok(status) if status.initiated => return status,
                Ok(_) => debug!(member = %member.name, "member reports no replica set"),
                Err(e) => debug!(member = %member.name, error = %e, "replica set status unavailable"),
            }
        }
        ReplicaSetStatus::default()
    }

    fn primary<'a>(&self, state: &'a ClusterState) -> Result<&'a Member> {
        state
            .primary_member()
            .ok_or_else(|| Error::TransientInfraError("no primary elected".to_string()))
    }

    async fn admin_password(&self, spec: &ClusterSpec) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &spec.namespace);
        let name = admin_secret_name(&spec.name);
        let secret = api.get(&name).await?;
        secret
            .data
            .as_ref()
            .and_then(|d| d.get("password"))
            .map(|p| String::from_utf8_lossy(&p.0).into_owned())
            .ok_or_else(|| Error::NotFound(format!("password in secret {}", name)))
    }
}

#[async_trait]
impl MemberBackend for KubeMemberBackend {
    async fn observe(&self, spec: &ClusterSpec) -> Result<ClusterState> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &spec.namespace);
        let list = pods
            .list(&ListParams::default().labels(&selector_string(&spec.name)))
            .await?;

        let members: Vec<Member> = list
            .items
            .iter()
            .filter_map(|pod| member_from_pod(spec, pod))
            .collect();
        let rs = self.replica_set_status(spec, &members).await;

        Ok(merge_replica_set_status(members, &rs))
    }

    async fn create_members(&self, spec: &ClusterSpec, count: i32) -> Result<()> {
        self.scale(spec, count).await
    }

    async fn initiate_replica_set(&self, spec: &ClusterSpec, state: &ClusterState) -> Result<()> {
        let seed = state
            .members
            .first()
            .ok_or_else(|| Error::TransientInfraError("no member to initiate".to_string()))?;
        let hosts: Vec<String> = state.members.iter().map(|m| m.endpoint.clone()).collect();
        info!(cluster = %spec.name, seed = %seed.name, members = hosts.len(), "initiating replica set");
        self.shell
            .initiate(&spec.namespace, seed, &spec.name, &hosts)
            .await
    }

    async fn join_member(
        &self,
        spec: &ClusterSpec,
        state: &ClusterState,
        member: &Member,
    ) -> Result<()> {
        let primary = self.primary(state)?;
        info!(cluster = %spec.name, member = %member.name, "adding member to replica set");
        self.shell
            .add_host(&spec.namespace, primary, &member.endpoint)
            .await
    }

    async fn add_member(&self, spec: &ClusterSpec, state: &ClusterState) -> Result<()> {
        self.scale(spec, state.member_count() + 1).await
    }

    async fn step_down(
        &self,
        spec: &ClusterSpec,
        _state: &ClusterState,
        member: &Member,
    ) -> Result<()> {
        info!(cluster = %spec.name, member = %member.name, "stepping down primary");
        self.shell.step_down(&spec.namespace, member).await
    }

    async fn remove_member(
        &self,
        spec: &ClusterSpec,
        state: &ClusterState,
        member: &Member,
    ) -> Result<()> {
        if member.joined {
            let primary = self.primary(state)?;
            info!(cluster = %spec.name, member = %member.name, "removing member from replica set");
            self.shell
                .remove_host(&spec.namespace, primary, &member.endpoint)
                .await?;
        }
        // The StatefulSet stops the highest ordinal, which is the member just removed
        self.scale(spec, state.member_count() - 1).await
    }

    async fn roll_member(&self, spec: &ClusterSpec, member: &Member) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &spec.namespace);
        info!(cluster = %spec.name, member = %member.name, "restarting member");
        match pods.delete(&member.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!(member = %member.name, "member pod already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn admit_traffic(&self, spec: &ClusterSpec, state: &ClusterState) -> Result<()> {
        let primary = self.primary(state)?;
        let password = self.admin_password(spec).await?;
        self.shell
            .ensure_user(&spec.namespace, primary, ADMIN_USERNAME, &password)
            .await?;

        let api: Api<Service> = Api::namespaced(self.client.clone(), &spec.namespace);
        api.patch(
            &client_service_name(&spec.name),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&generate_client_service(spec)),
        )
        .await?;
        info!(cluster = %spec.name, "client traffic admitted");
        Ok(())
    }
}
