//! Operator configuration from the environment
//!
//! Every setting has a default; a value that is present but unparsable is
//! logged and replaced by the default.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_BACKUP_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_BACKUP_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_RESTORE_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_STORAGE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RESTORE_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_TRANSIENT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MONGO_IMAGE: &str = "mongo:7.0";
pub const DEFAULT_STORAGE_SIZE: &str = "10Gi";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Lease holder identity
    pub pod_name: String,
    /// Namespace holding the leader lease
    pub pod_namespace: String,
    /// Only watch this namespace when set
    pub watch_namespace: Option<String>,
    pub health_port: u16,
    pub backup_poll_interval: Duration,
    /// Upper bound for one backup run
    pub backup_timeout: Duration,
    /// Upper bound for one restore attempt
    pub restore_timeout: Duration,
    /// Upper bound for each credential or storage call
    pub storage_timeout: Duration,
    /// Restore attempts before the cluster is marked Degraded
    pub restore_max_attempts: u32,
    /// Attempts per transient storage operation
    pub transient_max_attempts: u32,
    pub mongo_image: String,
    /// Volume size requested by each member
    pub storage_size: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pod_name: "unknown".to_string(),
            pod_namespace: "default".to_string(),
            watch_namespace: None,
            health_port: DEFAULT_HEALTH_PORT,
            backup_poll_interval: Duration::from_secs(DEFAULT_BACKUP_POLL_INTERVAL_SECS),
            backup_timeout: Duration::from_secs(DEFAULT_BACKUP_TIMEOUT_SECS),
            restore_timeout: Duration::from_secs(DEFAULT_RESTORE_TIMEOUT_SECS),
            storage_timeout: Duration::from_secs(DEFAULT_STORAGE_TIMEOUT_SECS),
            restore_max_attempts: DEFAULT_RESTORE_MAX_ATTEMPTS,
            transient_max_attempts: DEFAULT_TRANSIENT_MAX_ATTEMPTS,
            mongo_image: DEFAULT_MONGO_IMAGE.to_string(),
            storage_size: DEFAULT_STORAGE_SIZE.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Read the configuration from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let pod_name = get("POD_NAME").unwrap_or_else(|| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| defaults.pod_name.clone())
        });
        let pod_namespace = get("POD_NAMESPACE").unwrap_or_else(|| {
            warn!("POD_NAMESPACE not set, using 'default'");
            defaults.pod_namespace.clone()
        });

        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parse_or(get(key), key, default.as_secs()))
        };

        Self {
            pod_name,
            pod_namespace,
            watch_namespace: get("WATCH_NAMESPACE"),
            health_port: parse_or(get("HEALTH_PORT"), "HEALTH_PORT", defaults.health_port),
            backup_poll_interval: secs("BACKUP_POLL_INTERVAL_SECS", defaults.backup_poll_interval)
                .max(Duration::from_secs(1)),
            backup_timeout: secs("BACKUP_TIMEOUT_SECS", defaults.backup_timeout),
            restore_timeout: secs("RESTORE_TIMEOUT_SECS", defaults.restore_timeout),
            storage_timeout: secs("STORAGE_TIMEOUT_SECS", defaults.storage_timeout),
            restore_max_attempts: parse_or(
                get("RESTORE_MAX_ATTEMPTS"),
                "RESTORE_MAX_ATTEMPTS",
                defaults.restore_max_attempts,
            )
            .max(1),
            transient_max_attempts: parse_or(
                get("TRANSIENT_MAX_ATTEMPTS"),
                "TRANSIENT_MAX_ATTEMPTS",
                defaults.transient_max_attempts,
            )
            .max(1),
            mongo_image: get("MONGO_IMAGE").unwrap_or(defaults.mongo_image),
            storage_size: get("MONGO_STORAGE_SIZE").unwrap_or(defaults.storage_size),
        }
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match value {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using {}", key, raw, default);
            default
        }),
    }
}
