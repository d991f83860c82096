//! Validation and defaulting of the MongoCluster spec
//!
//! `normalize` is the only way the rest of the operator reads a spec: every
//! reconcile pass and every backup poll works from the `ClusterSpec` it
//! returns.

use kube::ResourceExt;

use crate::backup::cron::CronExpr;
use crate::controller::error::{Error, Result};
use crate::crd::{MongoCluster, SecretKeyRef};

/// Minimum number of replica set members
pub const MIN_REPLICAS: i32 = 3;

/// Maximum number of replica set members
pub const MAX_REPLICAS: i32 = 50;

/// Key prefix used when the manifest does not set one
pub const DEFAULT_BACKUP_PREFIX: &str = "backups";

pub const DEFAULT_CPU_LIMIT: &str = "1";
pub const DEFAULT_MEMORY_LIMIT: &str = "2Gi";

/// Literal `restore_from` value that selects the newest archive
pub const RESTORE_LATEST: &str = "latest";

const MEMORY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Where a new cluster's data comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreSource {
    /// Newest archive under the prefix
    Latest,
    /// Literal object key inside the restore bucket
    Key(String),
}

/// A validated, defaulted spec
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterSpec {
    pub name: String,
    pub namespace: String,
    /// `metadata.uid`, the cluster identity for restore bookkeeping
    pub uid: String,
    pub generation: i64,
    pub replicas: i32,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub backup_cron: CronExpr,
    pub bucket: String,
    /// Key prefix without a trailing slash
    pub prefix: String,
    pub restore_from: Option<RestoreSource>,
    pub restore_bucket: String,
    pub credential_ref: SecretKeyRef,
}

/// Validate a MongoCluster and fill in defaults
pub fn normalize(cluster: &MongoCluster) -> Result<ClusterSpec> {
    let spec = &cluster.spec;
    let gcs = &spec.backups.gcs;

    validate_replicas(spec.mongodb.replicas)?;

    let backup_cron = CronExpr::parse(&spec.backups.cron).map_err(|e| {
        Error::ValidationError(format!("invalid backup cron '{}': {}", spec.backups.cron, e))
    })?;

    let bucket = gcs.bucket.trim();
    if bucket.is_empty() {
        return Err(Error::ValidationError("backup bucket must not be empty".to_string()));
    }

    let cpu_limit = match spec.mongodb.cpu_limit.as_deref() {
        Some(cpu) => validate_cpu(cpu)?,
        None => DEFAULT_CPU_LIMIT.to_string(),
    };
    let memory_limit = match spec.mongodb.memory_limit.as_deref() {
        Some(memory) => validate_memory(memory)?,
        None => DEFAULT_MEMORY_LIMIT.to_string(),
    };

    let secret = &gcs.service_account.secret_key_ref;
    if secret.name.trim().is_empty() || secret.key.trim().is_empty() {
        return Err(Error::ValidationError(
            "serviceAccount.secretKeyRef requires both name and key".to_string(),
        ));
    }

    let prefix = match gcs.prefix.as_deref().map(|p| p.trim().trim_end_matches('/')) {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => DEFAULT_BACKUP_PREFIX.to_string(),
    };

    let restore_from = match gcs.restore_from.as_deref().map(str::trim) {
        None => None,
        Some("") => {
            return Err(Error::ValidationError(
                "restore_from must be \"latest\" or an archive key".to_string(),
            ));
        }
        Some(RESTORE_LATEST) => Some(RestoreSource::Latest),
        Some(key) => Some(RestoreSource::Key(key.to_string())),
    };

    let restore_bucket = match gcs.restore_bucket.as_deref().map(str::trim) {
        Some(b) if !b.is_empty() => b.to_string(),
        _ => bucket.to_string(),
    };

    Ok(ClusterSpec {
        name: cluster.name_any(),
        namespace: cluster.namespace().unwrap_or_default(),
        uid: cluster.uid().unwrap_or_default(),
        generation: cluster.metadata.generation.unwrap_or_default(),
        replicas: spec.mongodb.replicas,
        cpu_limit,
        memory_limit,
        backup_cron,
        bucket: bucket.to_string(),
        prefix,
        restore_from,
        restore_bucket,
        credential_ref: secret.clone(),
    })
}

fn validate_replicas(replicas: i32) -> Result<()> {
    if replicas < MIN_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} is below minimum {}",
            replicas, MIN_REPLICAS
        )));
    }

    if replicas > MAX_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} exceeds maximum {}",
            replicas, MAX_REPLICAS
        )));
    }

    Ok(())
}

/// CPU quantity in millicores: plain cores ("2", "0.5") or millicores ("500m")
///
/// The API server hands quantities back in canonical form, so limits are
/// compared through this value rather than as strings.
pub fn cpu_millis(cpu: &str) -> Option<u64> {
    let cpu = cpu.trim();
    let (number, scale) = match cpu.strip_suffix('m') {
        Some(millis) => (millis, 1.0),
        None => (cpu, 1000.0),
    };
    let value = number.parse::<f64>().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    // Sub-millicore precision rounds up, as the API server does
    Some((value * scale).ceil() as u64)
}

/// Memory quantity in bytes: plain bytes or a binary/decimal suffix ("512Mi", "2G")
pub fn memory_bytes(memory: &str) -> Option<u64> {
    let memory = memory.trim();
    let (number, scale) = MEMORY_SUFFIXES
        .iter()
        .find_map(|(suffix, scale)| memory.strip_suffix(suffix).map(|n| (n, *scale)))
        .unwrap_or((memory, 1.0));
    let value = number.parse::<f64>().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    Some((value * scale).ceil() as u64)
}

fn validate_cpu(cpu: &str) -> Result<String> {
    match cpu_millis(cpu) {
        Some(_) => Ok(cpu.trim().to_string()),
        None => Err(Error::ValidationError(format!("invalid cpu_limit: {}", cpu.trim()))),
    }
}

fn validate_memory(memory: &str) -> Result<String> {
    match memory_bytes(memory) {
        Some(_) => Ok(memory.trim().to_string()),
        None => Err(Error::ValidationError(format!(
            "invalid memory_limit: {}",
            memory.trim()
        ))),
    }
}

/// Result of comparing two normalized specs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecDiff {
    /// Scale direction (positive = up, negative = down)
    pub replica_delta: i32,
    /// CPU or memory limit changed
    pub resources_changed: bool,
    /// Schedule or destination changed
    pub backup_changed: bool,
}

impl SpecDiff {
    pub fn replicas_changed(&self) -> bool {
        self.replica_delta != 0
    }

    /// Resource changes are applied as a member-by-member roll
    pub fn requires_rolling_update(&self) -> bool {
        self.resources_changed
    }

    pub fn has_changes(&self) -> bool {
        self.replicas_changed() || self.resources_changed || self.backup_changed
    }
}

/// Compare two normalized specs
pub fn diff(old: &ClusterSpec, new: &ClusterSpec) -> SpecDiff {
    SpecDiff {
        replica_delta: new.replicas - old.replicas,
        resources_changed: cpu_millis(&old.cpu_limit) != cpu_millis(&new.cpu_limit)
            || memory_bytes(&old.memory_limit) != memory_bytes(&new.memory_limit),
        backup_changed: old.backup_cron != new.backup_cron
            || old.bucket != new.bucket
            || old.prefix != new.prefix,
    }
}
