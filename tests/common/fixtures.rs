//! Test fixtures and builders for MongoCluster resources
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let cluster = create_test_cluster("mongo", "default", 3);
//! let spec = test_spec(&cluster);
//! ```
//!
//! For more complex configurations, use the builder pattern:
//! ```rust,ignore
//! let cluster = MongoClusterBuilder::new("mongo", "default")
//!     .with_replicas(5)
//!     .with_restore_from("latest")
//!     .build();
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use kube::core::ObjectMeta;
use mongo_operator::backup::{RestoreController, StorageAccess};
use mongo_operator::controller::backend::DatabaseShell;
use mongo_operator::controller::cluster_state::{ClusterState, Member};
use mongo_operator::controller::normalize::{ClusterSpec, normalize};
use mongo_operator::controller::planner::{PassInput, PassOutcome, Step, run_pass};
use mongo_operator::controller::BackoffConfig;
use mongo_operator::crd::{
    BackupsSpec, ClusterPhase, GcsSpec, MongoCluster, MongoClusterSpec, MongoClusterStatus,
    MongoSpec, RestoreRecord, SecretKeyRef, ServiceAccountRef,
};
use mongo_operator::storage::{CredentialResolver, ObjectStorage};

use super::fakes::{FakeCredentials, FakeMemberBackend, FakeShell, InMemoryStorage};

pub const TEST_UID: &str = "test-uid-12345";
pub const TEST_BUCKET: &str = "mongo-backups";

// =============================================================================
// Convenience Functions for Simple Test Cases
// =============================================================================

/// Create a basic test cluster with a daily 02:00 backup schedule
pub fn create_test_cluster(name: &str, namespace: &str, replicas: i32) -> MongoCluster {
    MongoClusterBuilder::new(name, namespace)
        .with_replicas(replicas)
        .build()
}

/// Normalize a cluster that is known to be valid
pub fn test_spec(cluster: &MongoCluster) -> ClusterSpec {
    normalize(cluster).expect("fixture cluster should be valid")
}

/// 2019-02-07 at the given time, UTC
pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2019, 2, 7, hour, minute, 0).unwrap()
}

/// A running, joined member of the `mongo` cluster with default limits
pub fn member(ordinal: i32, healthy: bool) -> Member {
    Member {
        name: format!("mongo-{}", ordinal),
        ordinal,
        endpoint: format!("mongo-{}.mongo.default.svc.cluster.local:27017", ordinal),
        running: true,
        joined: true,
        healthy,
        created_at: Some(at(0, 0) + chrono::Duration::minutes(i64::from(ordinal))),
        cpu_limit: Some("1".to_string()),
        memory_limit: Some("2Gi".to_string()),
    }
}

/// Replica set of `count` healthy members with `mongo-0` as primary
pub fn healthy_state(count: i32) -> ClusterState {
    ClusterState::new(
        (0..count).map(|i| member(i, true)).collect(),
        Some("mongo-0".to_string()),
    )
}

/// Storage access with millisecond backoff so retries stay fast
pub fn fast_storage_access(
    storage: Arc<dyn ObjectStorage>,
    credentials: Arc<dyn CredentialResolver>,
) -> StorageAccess {
    let mut access = StorageAccess::new(storage, credentials, Duration::from_secs(5), 3);
    access.backoff = fast_backoff();
    access
}

pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

// =============================================================================
// MongoCluster Builder
// =============================================================================

/// Builder for MongoCluster test fixtures
#[allow(dead_code)]
pub struct MongoClusterBuilder {
    name: String,
    namespace: String,
    uid: Option<String>,
    generation: Option<i64>,
    replicas: i32,
    cpu_limit: Option<String>,
    memory_limit: Option<String>,
    cron: String,
    bucket: String,
    prefix: Option<String>,
    restore_from: Option<String>,
    restore_bucket: Option<String>,
    secret: SecretKeyRef,
    status: Option<MongoClusterStatus>,
}

#[allow(dead_code)]
impl MongoClusterBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: Some(TEST_UID.to_string()),
            generation: Some(1),
            replicas: 3,
            cpu_limit: None,
            memory_limit: None,
            cron: "0 2 * * *".to_string(),
            bucket: TEST_BUCKET.to_string(),
            prefix: None,
            restore_from: None,
            restore_bucket: None,
            secret: SecretKeyRef {
                name: "gcs-credentials".to_string(),
                key: "service-account.json".to_string(),
            },
            status: None,
        }
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = Some(uid.to_string());
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_limits(mut self, cpu: &str, memory: &str) -> Self {
        self.cpu_limit = Some(cpu.to_string());
        self.memory_limit = Some(memory.to_string());
        self
    }

    pub fn with_cron(mut self, cron: &str) -> Self {
        self.cron = cron.to_string();
        self
    }

    pub fn with_bucket(mut self, bucket: &str) -> Self {
        self.bucket = bucket.to_string();
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    pub fn with_restore_from(mut self, restore_from: &str) -> Self {
        self.restore_from = Some(restore_from.to_string());
        self
    }

    pub fn with_restore_bucket(mut self, bucket: &str) -> Self {
        self.restore_bucket = Some(bucket.to_string());
        self
    }

    pub fn with_secret(mut self, name: &str, key: &str) -> Self {
        self.secret = SecretKeyRef {
            name: name.to_string(),
            key: key.to_string(),
        };
        self
    }

    pub fn with_status(mut self, status: MongoClusterStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn build(self) -> MongoCluster {
        MongoCluster {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: self.uid,
                generation: self.generation,
                ..Default::default()
            },
            spec: MongoClusterSpec {
                mongodb: MongoSpec {
                    replicas: self.replicas,
                    cpu_limit: self.cpu_limit,
                    memory_limit: self.memory_limit,
                },
                backups: BackupsSpec {
                    cron: self.cron,
                    gcs: GcsSpec {
                        bucket: self.bucket,
                        prefix: self.prefix,
                        restore_from: self.restore_from,
                        restore_bucket: self.restore_bucket,
                        service_account: ServiceAccountRef {
                            secret_key_ref: self.secret,
                        },
                    },
                },
            },
            status: self.status,
        }
    }
}

// =============================================================================
// Reconcile pass driver
// =============================================================================

/// Runs reconcile passes against a `FakeMemberBackend`, carrying the
/// persisted status fields from one pass to the next the way the status
/// patch does.
#[allow(dead_code)]
pub struct PassDriver {
    pub backend: FakeMemberBackend,
    pub shell: Arc<FakeShell>,
    pub storage: Arc<InMemoryStorage>,
    pub restorer: RestoreController,
    pub phase: ClusterPhase,
    pub restore: Option<RestoreRecord>,
    pub admitted: bool,
    pub quorum_blocked_generation: Option<i64>,
    pub steps: Vec<Step>,
    pub now: DateTime<Utc>,
}

#[allow(dead_code)]
impl PassDriver {
    pub fn new() -> Self {
        Self::with_restore_attempts(3)
    }

    pub fn with_restore_attempts(max_attempts: u32) -> Self {
        let shell = Arc::new(FakeShell::default());
        let storage = Arc::new(InMemoryStorage::default());
        let access = fast_storage_access(storage.clone(), Arc::new(FakeCredentials::default()));
        let restorer = RestoreController::new(
            shell.clone() as Arc<dyn DatabaseShell>,
            access,
            Duration::from_secs(60),
            max_attempts,
        )
        .with_backoff(BackoffConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.0,
        });

        Self {
            backend: FakeMemberBackend::default(),
            shell,
            storage,
            restorer,
            phase: ClusterPhase::Bootstrapping,
            restore: None,
            admitted: false,
            quorum_blocked_generation: None,
            steps: Vec::new(),
            now: at(3, 0),
        }
    }

    /// Driver whose backend already runs an admitted replica set of `count`
    pub fn steady(count: i32) -> Self {
        let driver = Self::new();
        driver.backend.seed(healthy_state(count));
        Self {
            phase: ClusterPhase::Steady,
            admitted: true,
            ..driver
        }
    }

    /// One reconcile pass
    pub async fn pass(&mut self, spec: &ClusterSpec) -> PassOutcome {
        let outcome = run_pass(
            PassInput {
                spec,
                phase: self.phase,
                restore: self.restore.as_ref(),
                admitted: self.admitted,
                quorum_blocked_generation: self.quorum_blocked_generation,
            },
            &self.backend,
            &self.restorer,
            self.now,
        )
        .await
        .expect("pass should not fail against the fake backend");

        self.phase = outcome.phase;
        self.admitted = outcome.admitted;
        self.quorum_blocked_generation = outcome.quorum_blocked_generation;
        if let Some(record) = &outcome.restore {
            self.restore = Some(record.clone());
        }
        self.steps.push(outcome.step.clone());
        outcome
    }

    /// Run passes until one plans `Noop`, failing after `limit` passes
    pub async fn converge(&mut self, spec: &ClusterSpec, limit: usize) -> PassOutcome {
        for _ in 0..limit {
            let outcome = self.pass(spec).await;
            if outcome.step == Step::Noop {
                return outcome;
            }
            self.now += chrono::Duration::seconds(5);
        }
        panic!("no convergence after {} passes: {:?}", limit, self.steps);
    }
}
