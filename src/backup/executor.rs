//! Backup executor
//!
//! Takes one snapshot of a member and uploads it as a gzip archive. A record
//! only becomes `Complete` once storage acknowledged the upload; on any
//! failure the final key is deleted best-effort so listings never show a
//! partial archive. Older archives are never pruned.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::backup::StorageAccess;
use crate::backup::archive::{archive_key, backup_id, compress};
use crate::clock::Clock;
use crate::controller::backend::DatabaseShell;
use crate::controller::cluster_state::{ClusterState, Member};
use crate::controller::error::{Error, Result};
use crate::controller::normalize::ClusterSpec;
use crate::crd::{BackupPhase, BackupRecord};

/// Pick the member to snapshot
///
/// A healthy secondary with the lowest ordinal is preferred so the primary
/// never carries dump load; a healthy primary is the fallback.
pub fn select_source(state: &ClusterState) -> Result<&Member> {
    state
        .healthy_secondaries()
        .next()
        .or_else(|| state.primary_member().filter(|m| m.healthy))
        .ok_or_else(|| Error::TransientInfraError("no healthy member to back up from".to_string()))
}

/// The record a slot starts with
pub fn pending_record(spec: &ClusterSpec, slot: DateTime<Utc>) -> BackupRecord {
    BackupRecord::pending(
        backup_id(&spec.name, slot),
        &spec.bucket,
        archive_key(&spec.prefix, &spec.name, slot),
        slot,
    )
}

pub struct BackupExecutor {
    shell: Arc<dyn DatabaseShell>,
    storage: StorageAccess,
    clock: Arc<dyn Clock>,
    backup_timeout: Duration,
}

impl BackupExecutor {
    pub fn new(
        shell: Arc<dyn DatabaseShell>,
        storage: StorageAccess,
        clock: Arc<dyn Clock>,
        backup_timeout: Duration,
    ) -> Self {
        Self {
            shell,
            storage,
            clock,
            backup_timeout,
        }
    }

    /// Run one backup for `slot` and return its terminal record
    #[instrument(skip(self, state, spec), fields(cluster = %spec.name, namespace = %spec.namespace))]
    pub async fn execute(
        &self,
        state: &ClusterState,
        spec: &ClusterSpec,
        slot: DateTime<Utc>,
    ) -> BackupRecord {
        let mut record = pending_record(spec, slot);

        let result = match tokio::time::timeout(
            self.backup_timeout,
            self.run(state, spec, &mut record),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::TransientInfraError(format!(
                "backup exceeded {}s and was cancelled",
                self.backup_timeout.as_secs()
            ))),
        };

        match result {
            Ok(size) => {
                if let Err(e) = record.complete(size, self.clock.now()) {
                    warn!(error = %e, "could not complete backup record");
                } else {
                    info!(key = %record.archive_key, size_bytes = size, "backup complete");
                }
            }
            Err(e) => {
                if record.status == BackupPhase::Uploading {
                    self.discard(spec, &record).await;
                }
                warn!(id = %record.id, error = %e, "backup failed");
                if let Err(re) = record.fail(e.to_string(), self.clock.now()) {
                    warn!(error = %re, "could not mark backup record failed");
                }
            }
        }

        record
    }

    async fn run(
        &self,
        state: &ClusterState,
        spec: &ClusterSpec,
        record: &mut BackupRecord,
    ) -> Result<u64> {
        let source = select_source(state)?;
        record.source_member = Some(source.name.clone());
        info!(member = %source.name, "dumping member");

        let raw = self.shell.dump(&spec.namespace, source).await?;
        if raw.is_empty() {
            return Err(Error::DataIntegrityError(format!(
                "dump of {} produced no data",
                source.name
            )));
        }

        let archive = compress(&raw)
            .map_err(|e| Error::DataIntegrityError(format!("failed to compress dump: {}", e)))?;

        record.advance(BackupPhase::Uploading)?;
        self.storage
            .put(spec, &spec.bucket, &record.archive_key, &archive)
            .await?;

        Ok(u64::try_from(archive.len()).unwrap_or(u64::MAX))
    }

    /// Remove whatever may have landed at the final key
    async fn discard(&self, spec: &ClusterSpec, record: &BackupRecord) {
        match self
            .storage
            .delete(spec, &record.bucket, &record.archive_key)
            .await
        {
            Ok(()) => info!(key = %record.archive_key, "removed partial archive"),
            Err(Error::StorageError(e)) if e.is_not_found() => {}
            Err(e) => warn!(key = %record.archive_key, error = %e, "failed to remove partial archive"),
        }
    }
}
