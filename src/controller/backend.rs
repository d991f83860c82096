//! Seams between the planning core and the live cluster
//!
//! The reconciler decides; a `MemberBackend` carries the decision out against
//! Kubernetes, and a `DatabaseShell` talks to mongod inside member pods.
//! Both are traits so the planning core and the backup/restore paths can be
//! exercised against in-memory fakes.

use async_trait::async_trait;

use crate::controller::cluster_state::{ClusterState, Member};
use crate::controller::error::Result;
use crate::controller::normalize::ClusterSpec;

/// Replica set member state as reported by `rs.status()`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberRole {
    Primary,
    Secondary,
    /// STARTUP, STARTUP2, RECOVERING, ROLLBACK and similar transitional states
    Syncing,
    /// DOWN, UNKNOWN, REMOVED or unreachable
    Unavailable,
}

impl MemberRole {
    /// Map the numeric `state` field of `rs.status()`
    pub fn from_state(state: i64) -> Self {
        match state {
            1 => MemberRole::Primary,
            2 => MemberRole::Secondary,
            0 | 3 | 5 | 9 => MemberRole::Syncing,
            _ => MemberRole::Unavailable,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, MemberRole::Primary | MemberRole::Secondary)
    }
}

/// One entry of the replica set status
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaSetMember {
    /// `host:port` as configured in the replica set
    pub host: String,
    pub role: MemberRole,
}

/// Replica set view from one member's perspective
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaSetStatus {
    /// False until `rs.initiate()` has run
    pub initiated: bool,
    pub members: Vec<ReplicaSetMember>,
}

impl ReplicaSetStatus {
    pub fn primary_host(&self) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.role == MemberRole::Primary)
            .map(|m| m.host.as_str())
    }

    pub fn member(&self, host: &str) -> Option<&ReplicaSetMember> {
        self.members.iter().find(|m| m.host == host)
    }
}

/// Commands run inside a member's mongod container
#[async_trait]
pub trait DatabaseShell: Send + Sync {
    /// Raw `mongodump --archive` output of the member
    async fn dump(&self, namespace: &str, member: &Member) -> Result<Vec<u8>>;

    /// Load a raw archive with `mongorestore --archive --drop`
    async fn restore(&self, namespace: &str, member: &Member, archive: Vec<u8>) -> Result<()>;

    async fn replica_set_status(&self, namespace: &str, member: &Member)
    -> Result<ReplicaSetStatus>;

    /// `rs.initiate()` with the given hosts
    async fn initiate(
        &self,
        namespace: &str,
        member: &Member,
        set_name: &str,
        hosts: &[String],
    ) -> Result<()>;

    /// `rs.add(host)`, run against the primary
    async fn add_host(&self, namespace: &str, primary: &Member, host: &str) -> Result<()>;

    /// `rs.remove(host)`, run against the primary
    async fn remove_host(&self, namespace: &str, primary: &Member, host: &str) -> Result<()>;

    /// `rs.stepDown()`, run against the primary
    async fn step_down(&self, namespace: &str, primary: &Member) -> Result<()>;

    /// Create a root user unless it already exists, run against the primary
    async fn ensure_user(
        &self,
        namespace: &str,
        primary: &Member,
        username: &str,
        password: &str,
    ) -> Result<()>;
}

/// Topology actions against the live cluster
#[async_trait]
pub trait MemberBackend: Send + Sync {
    /// Current members, their health and the primary
    async fn observe(&self, spec: &ClusterSpec) -> Result<ClusterState>;

    /// Create the initial `count` members
    async fn create_members(&self, spec: &ClusterSpec, count: i32) -> Result<()>;

    /// Initiate the replica set on the lowest-ordinal member
    async fn initiate_replica_set(&self, spec: &ClusterSpec, state: &ClusterState) -> Result<()>;

    /// Add a running member to the replica set configuration
    async fn join_member(&self, spec: &ClusterSpec, state: &ClusterState, member: &Member)
    -> Result<()>;

    /// Start one additional member
    async fn add_member(&self, spec: &ClusterSpec, state: &ClusterState) -> Result<()>;

    /// Hand the primary role to another member
    async fn step_down(&self, spec: &ClusterSpec, state: &ClusterState, member: &Member)
    -> Result<()>;

    /// Remove a secondary from the replica set and stop it
    async fn remove_member(
        &self,
        spec: &ClusterSpec,
        state: &ClusterState,
        member: &Member,
    ) -> Result<()>;

    /// Restart a member so it picks up the current resource limits
    async fn roll_member(&self, spec: &ClusterSpec, member: &Member) -> Result<()>;

    /// Expose the replica set to clients
    async fn admit_traffic(&self, spec: &ClusterSpec, state: &ClusterState) -> Result<()>;
}
