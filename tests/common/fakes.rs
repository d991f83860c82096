//! In-memory stand-ins for the live cluster, mongod and object storage
//!
//! Each fake keeps its state behind a mutex and records what it was asked
//! to do, so tests can assert on the sequence of operations.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongo_operator::backup::{BackupLedger, FireTimeStore};
use mongo_operator::clock::Clock;
use mongo_operator::controller::backend::{DatabaseShell, MemberBackend, ReplicaSetStatus};
use mongo_operator::controller::cluster_state::{ClusterState, Member};
use mongo_operator::controller::normalize::ClusterSpec;
use mongo_operator::controller::{Error, Result};
use mongo_operator::crd::{BackupRecord, SecretKeyRef};
use mongo_operator::storage::{Credential, CredentialResolver, ObjectStorage, StorageError};
use secrecy::SecretString;

use super::fixtures::at;

// =============================================================================
// Clock
// =============================================================================

/// Clock that only moves when told to
#[allow(dead_code)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

#[allow(dead_code)]
impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// =============================================================================
// Credentials and object storage
// =============================================================================

#[derive(Default)]
#[allow(dead_code)]
pub struct FakeCredentials {
    pub fail: AtomicBool,
    pub calls: AtomicU32,
}

#[async_trait]
impl CredentialResolver for FakeCredentials {
    async fn resolve(
        &self,
        _namespace: &str,
        secret: &SecretKeyRef,
    ) -> std::result::Result<Credential, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Credential(format!(
                "secret {} has no key {}",
                secret.name, secret.key
            )));
        }
        Ok(Credential {
            token: SecretString::from("test-token"),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

/// Bucket/key map with switchable failures
#[derive(Default)]
#[allow(dead_code)]
pub struct InMemoryStorage {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    /// Reject uploads before anything is written
    pub fail_put: AtomicBool,
    /// Write the object, then report the upload as failed
    pub partial_put: AtomicBool,
    pub fail_get: AtomicBool,
    pub puts: AtomicU32,
    pub deletes: AtomicU32,
}

#[allow(dead_code)]
impl InMemoryStorage {
    pub fn insert(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), bytes);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectStorage for InMemoryStorage {
    async fn put(
        &self,
        _credential: &Credential,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> std::result::Result<(), StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(StorageError::Http {
                status: Some(403),
                message: "permission denied".to_string(),
            });
        }
        self.insert(bucket, key, bytes);
        if self.partial_put.load(Ordering::SeqCst) {
            return Err(StorageError::Http {
                status: Some(503),
                message: "connection reset during upload".to_string(),
            });
        }
        Ok(())
    }

    async fn get(
        &self,
        _credential: &Credential,
        bucket: &str,
        key: &str,
    ) -> std::result::Result<Vec<u8>, StorageError> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(StorageError::Http {
                status: Some(503),
                message: "service unavailable".to_string(),
            });
        }
        self.object(bucket, key)
            .ok_or_else(|| StorageError::NotFound(format!("gs://{}/{}", bucket, key)))
    }

    async fn list(
        &self,
        _credential: &Credential,
        bucket: &str,
        prefix: &str,
    ) -> std::result::Result<Vec<String>, StorageError> {
        Ok(self
            .keys(bucket)
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn delete(
        &self,
        _credential: &Credential,
        bucket: &str,
        key: &str,
    ) -> std::result::Result<(), StorageError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("gs://{}/{}", bucket, key)))
    }
}

// =============================================================================
// mongod shell
// =============================================================================

#[derive(Default)]
#[allow(dead_code)]
pub struct ShellLog {
    pub dumped_from: Vec<String>,
    /// Member name and raw archive of every restore
    pub restored: Vec<(String, Vec<u8>)>,
}

/// Shell whose dumps return fixed bytes and whose restores are recorded
#[allow(dead_code)]
pub struct FakeShell {
    pub dump_data: Mutex<Vec<u8>>,
    pub fail_restore: AtomicBool,
    pub log: Mutex<ShellLog>,
}

impl Default for FakeShell {
    fn default() -> Self {
        Self {
            dump_data: Mutex::new(b"mongodump archive".repeat(64)),
            fail_restore: AtomicBool::new(false),
            log: Mutex::new(ShellLog::default()),
        }
    }
}

#[allow(dead_code)]
impl FakeShell {
    pub fn dumped_from(&self) -> Vec<String> {
        self.log.lock().unwrap().dumped_from.clone()
    }

    pub fn restored(&self) -> Vec<(String, Vec<u8>)> {
        self.log.lock().unwrap().restored.clone()
    }
}

#[async_trait]
impl DatabaseShell for FakeShell {
    async fn dump(&self, _namespace: &str, member: &Member) -> Result<Vec<u8>> {
        self.log.lock().unwrap().dumped_from.push(member.name.clone());
        Ok(self.dump_data.lock().unwrap().clone())
    }

    async fn restore(&self, _namespace: &str, member: &Member, archive: Vec<u8>) -> Result<()> {
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(Error::TransientInfraError(format!(
                "mongorestore on {} exited with 1",
                member.name
            )));
        }
        self.log
            .lock()
            .unwrap()
            .restored
            .push((member.name.clone(), archive));
        Ok(())
    }

    async fn replica_set_status(
        &self,
        _namespace: &str,
        _member: &Member,
    ) -> Result<ReplicaSetStatus> {
        Ok(ReplicaSetStatus::default())
    }

    async fn initiate(
        &self,
        _namespace: &str,
        _member: &Member,
        _set_name: &str,
        _hosts: &[String],
    ) -> Result<()> {
        Ok(())
    }

    async fn add_host(&self, _namespace: &str, _primary: &Member, _host: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_host(&self, _namespace: &str, _primary: &Member, _host: &str) -> Result<()> {
        Ok(())
    }

    async fn step_down(&self, _namespace: &str, _primary: &Member) -> Result<()> {
        Ok(())
    }

    async fn ensure_user(
        &self,
        _namespace: &str,
        _primary: &Member,
        _username: &str,
        _password: &str,
    ) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Scheduler persistence
// =============================================================================

#[derive(Default)]
#[allow(dead_code)]
pub struct MemoryFireStore {
    fires: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

#[allow(dead_code)]
impl MemoryFireStore {
    pub fn last(&self, cluster: &str) -> Option<DateTime<Utc>> {
        self.fires.lock().unwrap().get(cluster).copied()
    }
}

#[async_trait]
impl FireTimeStore for MemoryFireStore {
    async fn last_fire(&self, spec: &ClusterSpec) -> Result<Option<DateTime<Utc>>> {
        Ok(self.last(&spec.name))
    }

    async fn record_fire(&self, spec: &ClusterSpec, slot: DateTime<Utc>) -> Result<()> {
        self.fires.lock().unwrap().insert(spec.name.clone(), slot);
        Ok(())
    }
}

/// Ledger keeping every appended version of every record
#[derive(Default)]
#[allow(dead_code)]
pub struct MemoryLedger {
    pub appends: Mutex<Vec<BackupRecord>>,
}

#[allow(dead_code)]
impl MemoryLedger {
    /// Latest version of each record, in first-append order
    pub fn records(&self) -> Vec<BackupRecord> {
        let appends = self.appends.lock().unwrap();
        let mut records: Vec<BackupRecord> = Vec::new();
        for record in appends.iter() {
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => records.push(record.clone()),
            }
        }
        records
    }
}

#[async_trait]
impl BackupLedger for MemoryLedger {
    async fn append(&self, _spec: &ClusterSpec, record: &BackupRecord) -> Result<()> {
        self.appends.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// =============================================================================
// Member backend
// =============================================================================

#[derive(Default)]
struct Topology {
    members: Vec<Member>,
    primary: Option<String>,
    admitted: bool,
    ops: Vec<String>,
    /// Fewest healthy members seen after the replica set was initiated
    min_healthy: Option<usize>,
    /// Creation order counter for new members
    created: i64,
}

impl Topology {
    fn healthy(&self) -> usize {
        self.members.iter().filter(|m| m.healthy).count()
    }

    fn track(&mut self, op: String) {
        self.ops.push(op);
        if self.primary.is_some() {
            let healthy = self.healthy();
            self.min_healthy = Some(self.min_healthy.map_or(healthy, |m| m.min(healthy)));
        }
    }

    fn new_member(&mut self, spec: &ClusterSpec, ordinal: i32) -> Member {
        self.created += 1;
        Member {
            name: format!("{}-{}", spec.name, ordinal),
            ordinal,
            endpoint: format!(
                "{}-{}.{}.{}.svc.cluster.local:27017",
                spec.name, ordinal, spec.name, spec.namespace
            ),
            running: true,
            joined: false,
            healthy: false,
            created_at: Some(at(1, 0) + chrono::Duration::minutes(self.created)),
            cpu_limit: Some(spec.cpu_limit.clone()),
            memory_limit: Some(spec.memory_limit.clone()),
        }
    }

    fn member_mut(&mut self, name: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.name == name)
    }
}

/// Simulated replica set that applies every topology action immediately
#[derive(Default)]
#[allow(dead_code)]
pub struct FakeMemberBackend {
    topology: Mutex<Topology>,
}

#[allow(dead_code)]
impl FakeMemberBackend {
    /// Start from an existing replica set
    pub fn seed(&self, state: ClusterState) {
        let mut topology = self.topology.lock().unwrap();
        topology.created = i64::try_from(state.members.len()).unwrap();
        topology.members = state.members;
        topology.primary = state.primary;
    }

    pub fn set_healthy(&self, name: &str, healthy: bool) {
        let mut topology = self.topology.lock().unwrap();
        if let Some(m) = topology.member_mut(name) {
            m.healthy = healthy;
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.topology.lock().unwrap().ops.clone()
    }

    pub fn member_names(&self) -> Vec<String> {
        let topology = self.topology.lock().unwrap();
        topology.members.iter().map(|m| m.name.clone()).collect()
    }

    pub fn members(&self) -> Vec<Member> {
        self.topology.lock().unwrap().members.clone()
    }

    pub fn primary(&self) -> Option<String> {
        self.topology.lock().unwrap().primary.clone()
    }

    pub fn admitted(&self) -> bool {
        self.topology.lock().unwrap().admitted
    }

    pub fn min_healthy(&self) -> Option<usize> {
        self.topology.lock().unwrap().min_healthy
    }
}

#[async_trait]
impl MemberBackend for FakeMemberBackend {
    async fn observe(&self, _spec: &ClusterSpec) -> Result<ClusterState> {
        let topology = self.topology.lock().unwrap();
        Ok(ClusterState::new(
            topology.members.clone(),
            topology.primary.clone(),
        ))
    }

    async fn create_members(&self, spec: &ClusterSpec, count: i32) -> Result<()> {
        let mut topology = self.topology.lock().unwrap();
        for ordinal in 0..count {
            let member = topology.new_member(spec, ordinal);
            topology.members.push(member);
        }
        topology.track(format!("create {}", count));
        Ok(())
    }

    async fn initiate_replica_set(&self, _spec: &ClusterSpec, _state: &ClusterState) -> Result<()> {
        let mut topology = self.topology.lock().unwrap();
        for m in &mut topology.members {
            m.joined = true;
            m.healthy = true;
        }
        topology.primary = topology.members.first().map(|m| m.name.clone());
        topology.track("initiate".to_string());
        Ok(())
    }

    async fn join_member(
        &self,
        _spec: &ClusterSpec,
        _state: &ClusterState,
        member: &Member,
    ) -> Result<()> {
        let mut topology = self.topology.lock().unwrap();
        if let Some(m) = topology.member_mut(&member.name) {
            m.joined = true;
            m.healthy = true;
        }
        topology.track(format!("join {}", member.name));
        Ok(())
    }

    async fn add_member(&self, spec: &ClusterSpec, _state: &ClusterState) -> Result<()> {
        let mut topology = self.topology.lock().unwrap();
        let ordinal = topology
            .members
            .iter()
            .map(|m| m.ordinal + 1)
            .max()
            .unwrap_or(0);
        let member = topology.new_member(spec, ordinal);
        topology.track(format!("add {}", member.name));
        topology.members.push(member);
        Ok(())
    }

    async fn step_down(
        &self,
        _spec: &ClusterSpec,
        _state: &ClusterState,
        member: &Member,
    ) -> Result<()> {
        let mut topology = self.topology.lock().unwrap();
        let successor = topology
            .members
            .iter()
            .find(|m| m.healthy && m.name != member.name)
            .map(|m| m.name.clone());
        if successor.is_none() {
            return Err(Error::QuorumRiskError(format!(
                "no electable member to replace {}",
                member.name
            )));
        }
        topology.primary = successor;
        topology.track(format!("step_down {}", member.name));
        Ok(())
    }

    async fn remove_member(
        &self,
        _spec: &ClusterSpec,
        _state: &ClusterState,
        member: &Member,
    ) -> Result<()> {
        let mut topology = self.topology.lock().unwrap();
        if topology.primary.as_deref() == Some(member.name.as_str()) {
            return Err(Error::QuorumRiskError(format!(
                "refusing to remove primary {}",
                member.name
            )));
        }
        topology.members.retain(|m| m.name != member.name);
        topology.track(format!("remove {}", member.name));
        Ok(())
    }

    async fn roll_member(&self, spec: &ClusterSpec, member: &Member) -> Result<()> {
        let mut topology = self.topology.lock().unwrap();
        topology.created += 1;
        let created_at = Some(at(1, 0) + chrono::Duration::minutes(topology.created));
        if let Some(m) = topology.member_mut(&member.name) {
            m.cpu_limit = Some(spec.cpu_limit.clone());
            m.memory_limit = Some(spec.memory_limit.clone());
            m.created_at = created_at;
        }
        topology.track(format!("roll {}", member.name));
        Ok(())
    }

    async fn admit_traffic(&self, _spec: &ClusterSpec, _state: &ClusterState) -> Result<()> {
        let mut topology = self.topology.lock().unwrap();
        topology.admitted = true;
        topology.track("admit".to_string());
        Ok(())
    }
}
