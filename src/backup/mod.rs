//! Scheduled backups and the one-time restore
//!
//! - `cron`: 5-field cron expressions evaluated against injected time
//! - `archive`: archive naming, gzip and "latest" selection
//! - `scheduler`: fires at most once per cron slot
//! - `executor`: dump, compress and upload one backup
//! - `restore`: bootstrap a fresh cluster from an archive
//! - `ledger`: persistence of backup and restore records in the resource status

pub mod archive;
pub mod cron;
pub mod executor;
pub mod ledger;
pub mod restore;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use crate::controller::error::{BackoffConfig, Error, Result, retry_transient};
use crate::controller::normalize::ClusterSpec;
use crate::storage::{Credential, CredentialResolver, ObjectStorage, with_timeout};

pub use cron::{CronExpr, CronParseError};
pub use executor::BackupExecutor;
pub use ledger::StatusLedger;
pub use restore::RestoreController;
pub use scheduler::{BackupLedger, BackupScheduler, FireTimeStore, PollDecision};

/// Object storage plus the limits every storage call runs under
///
/// Each operation resolves a fresh credential, and both the resolution and
/// the storage call are bounded by `timeout` and retried while the error is
/// transient.
#[derive(Clone)]
pub struct StorageAccess {
    pub storage: Arc<dyn ObjectStorage>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub timeout: Duration,
    pub backoff: BackoffConfig,
    pub max_attempts: u32,
}

impl StorageAccess {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        credentials: Arc<dyn CredentialResolver>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            storage,
            credentials,
            timeout,
            backoff: BackoffConfig::transient(),
            max_attempts: max_attempts.max(1),
        }
    }

    async fn credential(&self, spec: &ClusterSpec) -> Result<Credential> {
        let this = self;
        retry_transient(&self.backoff, self.max_attempts, "resolve credential", move || async move {
            with_timeout(
                this.timeout,
                "resolve credential",
                this.credentials.resolve(&spec.namespace, &spec.credential_ref),
            )
            .await
            .map_err(Error::from)
        })
        .await
    }

    pub async fn put(&self, spec: &ClusterSpec, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let credential = self.credential(spec).await?;
        let (this, credential) = (self, &credential);
        retry_transient(&self.backoff, self.max_attempts, "upload archive", move || async move {
            with_timeout(
                this.timeout,
                "upload archive",
                this.storage.put(credential, bucket, key, bytes.to_vec()),
            )
            .await
            .map_err(Error::from)
        })
        .await
    }

    pub async fn get(&self, spec: &ClusterSpec, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let credential = self.credential(spec).await?;
        let (this, credential) = (self, &credential);
        retry_transient(&self.backoff, self.max_attempts, "download archive", move || async move {
            with_timeout(
                this.timeout,
                "download archive",
                this.storage.get(credential, bucket, key),
            )
            .await
            .map_err(Error::from)
        })
        .await
    }

    pub async fn list(&self, spec: &ClusterSpec, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let credential = self.credential(spec).await?;
        let (this, credential) = (self, &credential);
        retry_transient(&self.backoff, self.max_attempts, "list archives", move || async move {
            with_timeout(
                this.timeout,
                "list archives",
                this.storage.list(credential, bucket, prefix),
            )
            .await
            .map_err(Error::from)
        })
        .await
    }

    pub async fn delete(&self, spec: &ClusterSpec, bucket: &str, key: &str) -> Result<()> {
        let credential = self.credential(spec).await?;
        let (this, credential) = (self, &credential);
        retry_transient(&self.backoff, self.max_attempts, "delete archive", move || async move {
            with_timeout(
                this.timeout,
                "delete archive",
                this.storage.delete(credential, bucket, key),
            )
            .await
            .map_err(Error::from)
        })
        .await
    }
}
