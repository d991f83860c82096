//! Observed replica set state
//!
//! `ClusterState` is produced by the member backend on every reconcile pass
//! and published to the `ClusterStateStore`. Only the reconciler publishes;
//! every other reader (the backup scheduler in particular) receives an owned
//! snapshot, so membership changes never race with snapshot-source selection.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::controller::normalize::{cpu_millis, memory_bytes};

/// One replica set member as observed
#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    /// Pod name, `{cluster}-{ordinal}`
    pub name: String,
    pub ordinal: i32,
    /// Stable DNS endpoint (`host:port`) used in the replica set config
    pub endpoint: String,
    /// The pod exists and its mongod container is running
    pub running: bool,
    /// The member is part of the replica set configuration
    pub joined: bool,
    /// The member reports PRIMARY or SECONDARY and is in sync
    pub healthy: bool,
    pub created_at: Option<DateTime<Utc>>,
    /// Limits the member is currently running with
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

impl Member {
    /// Whether the member runs with the given resource limits
    ///
    /// Quantities are compared by value; `0.5` and `500m` are the same limit.
    pub fn has_limits(&self, cpu: &str, memory: &str) -> bool {
        same_quantity(self.cpu_limit.as_deref(), cpu, cpu_millis)
            && same_quantity(self.memory_limit.as_deref(), memory, memory_bytes)
    }
}

fn same_quantity(observed: Option<&str>, desired: &str, parse: fn(&str) -> Option<u64>) -> bool {
    let Some(observed) = observed else {
        return false;
    };
    match (parse(observed), parse(desired)) {
        (Some(a), Some(b)) => a == b,
        _ => observed == desired,
    }
}

/// Snapshot of a replica set
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterState {
    /// Members ordered by ordinal
    pub members: Vec<Member>,
    /// Name of the member currently holding the primary role
    pub primary: Option<String>,
    /// Member count at the end of the last reconcile pass
    pub last_known_replicas: i32,
}

impl ClusterState {
    pub fn new(mut members: Vec<Member>, primary: Option<String>) -> Self {
        members.sort_by_key(|m| m.ordinal);
        let last_known_replicas = i32::try_from(members.len()).unwrap_or(i32::MAX);
        Self {
            members,
            primary,
            last_known_replicas,
        }
    }

    pub fn member_count(&self) -> i32 {
        i32::try_from(self.members.len()).unwrap_or(i32::MAX)
    }

    pub fn healthy_count(&self) -> i32 {
        i32::try_from(self.members.iter().filter(|m| m.healthy).count()).unwrap_or(i32::MAX)
    }

    pub fn all_healthy(&self) -> bool {
        !self.members.is_empty() && self.members.iter().all(|m| m.healthy)
    }

    /// Votes needed for a majority of the current member set
    pub fn majority(&self) -> i32 {
        majority_of(self.member_count())
    }

    pub fn has_majority(&self) -> bool {
        self.healthy_count() >= self.majority()
    }

    pub fn is_primary(&self, member: &Member) -> bool {
        self.primary.as_deref() == Some(member.name.as_str())
    }

    pub fn primary_member(&self) -> Option<&Member> {
        let primary = self.primary.as_deref()?;
        self.members.iter().find(|m| m.name == primary)
    }

    /// Healthy members that do not hold the primary role, lowest ordinal first
    pub fn healthy_secondaries(&self) -> impl Iterator<Item = &Member> {
        self.members
            .iter()
            .filter(move |m| m.healthy && !self.is_primary(m))
    }

    pub fn highest_ordinal(&self) -> Option<&Member> {
        self.members.iter().max_by_key(|m| m.ordinal)
    }

    /// Members whose limits differ from the desired ones, oldest first
    pub fn outdated_members(&self, cpu: &str, memory: &str) -> Vec<&Member> {
        let mut outdated: Vec<&Member> = self
            .members
            .iter()
            .filter(|m| !m.has_limits(cpu, memory))
            .collect();
        outdated.sort_by(|a, b| {
            // Members without a creation time sort last
            let a_key = (a.created_at.is_none(), a.created_at, a.ordinal);
            let b_key = (b.created_at.is_none(), b.created_at, b.ordinal);
            a_key.cmp(&b_key)
        });
        outdated
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name.clone()).collect()
    }
}

/// Votes needed for a majority of `n` members
pub fn majority_of(n: i32) -> i32 {
    n / 2 + 1
}

/// Latest published state per cluster, keyed by `namespace/name`
#[derive(Clone, Default)]
pub struct ClusterStateStore {
    inner: Arc<RwLock<HashMap<String, ClusterState>>>,
}

impl ClusterStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(namespace: &str, name: &str) -> String {
        format!("{}/{}", namespace, name)
    }

    /// Replace the state of a cluster; called by the reconciler only
    pub async fn publish(&self, namespace: &str, name: &str, state: ClusterState) {
        self.inner
            .write()
            .await
            .insert(Self::key(namespace, name), state);
    }

    /// Owned copy of the latest state of a cluster
    pub async fn snapshot(&self, namespace: &str, name: &str) -> Option<ClusterState> {
        self.inner
            .read()
            .await
            .get(&Self::key(namespace, name))
            .cloned()
    }

    pub async fn remove(&self, namespace: &str, name: &str) {
        self.inner.write().await.remove(&Self::key(namespace, name));
    }
}
