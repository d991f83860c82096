use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{BackupRecord, RestoreRecord};

/// MongoCluster is the Schema for the mongoclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "operators.ultimaker.com",
    version = "v1",
    kind = "MongoCluster",
    plural = "mongoclusters",
    shortname = "mongo",
    namespaced,
    status = "MongoClusterStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.mongodb.replicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyMembers"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.primary"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct MongoClusterSpec {
    /// Replica set topology and resources
    pub mongodb: MongoSpec,

    /// Backup schedule and destination
    pub backups: BackupsSpec,
}

/// Replica set sizing for the MongoDB members
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct MongoSpec {
    /// Number of replica set members (3 to 50)
    pub replicas: i32,

    /// CPU limit per member (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,

    /// Memory limit per member (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Backup configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct BackupsSpec {
    /// Backup schedule in standard 5-field cron format
    pub cron: String,

    /// Google Cloud Storage destination
    pub gcs: GcsSpec,
}

/// Google Cloud Storage destination for archives
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct GcsSpec {
    /// Bucket that receives new archives
    pub bucket: String,

    /// Key prefix for archives (defaults to "backups")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Archive to seed a new cluster from: "latest" or a literal object key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_from: Option<String>,

    /// Bucket to restore from when it differs from `bucket`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_bucket: Option<String>,

    /// Service account used for storage access
    #[serde(rename = "serviceAccount")]
    pub service_account: ServiceAccountRef,
}

/// Service account credentials reference
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ServiceAccountRef {
    #[serde(rename = "secretKeyRef")]
    pub secret_key_ref: SecretKeyRef,
}

/// Pointer to a key inside a Kubernetes Secret
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Status of the MongoCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MongoClusterStatus {
    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Number of healthy replica set members
    #[serde(default)]
    pub ready_members: i32,

    /// Observed member names, ordered by ordinal
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,

    /// Name of the member currently holding the primary role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,

    /// Whether the client service has been created
    #[serde(default)]
    pub admitted: bool,

    /// Generation whose scaling request was aborted for quorum safety
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum_blocked_generation: Option<i64>,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Last reconcile error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Time of the last reconcile error (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<String>,

    /// When the current phase was entered (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<String>,

    /// Restore bookkeeping, written only by the restore controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreRecord>,

    /// Backup bookkeeping, written only by the backup scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupStatus>,
}

/// Backup scheduler state persisted on the resource
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Cron slot most recently accounted for by the scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scheduled_time: Option<DateTime<Utc>>,

    /// Most recent backup record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<BackupRecord>,

    /// Recent backup records, newest last
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<BackupRecord>,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum ClusterPhase {
    /// No members exist yet
    #[default]
    Bootstrapping,
    /// Members exist and the configured archive is being loaded
    Restoring,
    /// Observed topology matches the spec
    Steady,
    /// Members are being added or removed one at a time
    Scaling,
    /// Majority unhealthy or restore retries exhausted
    Degraded,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Bootstrapping => write!(f, "Bootstrapping"),
            ClusterPhase::Restoring => write!(f, "Restoring"),
            ClusterPhase::Steady => write!(f, "Steady"),
            ClusterPhase::Scaling => write!(f, "Scaling"),
            ClusterPhase::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
