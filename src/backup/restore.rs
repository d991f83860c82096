//! Restore controller
//!
//! Loads the configured archive into a freshly bootstrapped replica set. Every
//! attempt starts from scratch: resolve the key, download, verify, apply. The
//! target is empty before admission, so a repeated attempt is safe. The
//! returned record carries the backoff deadline for the next attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::backup::StorageAccess;
use crate::backup::archive::{decompress, listing_prefix, select_latest};
use crate::controller::backend::DatabaseShell;
use crate::controller::cluster_state::{ClusterState, Member};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::normalize::{ClusterSpec, RestoreSource};
use crate::crd::{RestorePhase, RestoreRecord};

/// Whether a restore still has to run for this cluster identity
pub fn restore_pending(spec: &ClusterSpec, record: Option<&RestoreRecord>) -> bool {
    spec.restore_from.is_some()
        && !record.is_some_and(|r| r.cluster_uid == spec.uid && r.is_complete())
}

/// Whether the record has used up its attempts without completing
pub fn is_exhausted(record: &RestoreRecord, max_attempts: u32) -> bool {
    !record.is_complete() && record.status == RestorePhase::Failed && record.attempts >= max_attempts
}

/// Member an archive is applied to: the primary, else the first healthy member
pub fn restore_target(state: &ClusterState) -> Result<&Member> {
    state
        .primary_member()
        .filter(|m| m.healthy)
        .or_else(|| state.members.iter().find(|m| m.healthy))
        .ok_or_else(|| Error::TransientInfraError("no healthy member to restore into".to_string()))
}

pub struct RestoreController {
    shell: Arc<dyn DatabaseShell>,
    storage: StorageAccess,
    restore_timeout: Duration,
    backoff: BackoffConfig,
    max_attempts: u32,
}

impl RestoreController {
    pub fn new(
        shell: Arc<dyn DatabaseShell>,
        storage: StorageAccess,
        restore_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            shell,
            storage,
            restore_timeout,
            backoff: BackoffConfig::default(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run one restore attempt unless the record says not to
    ///
    /// A record from another cluster identity is ignored. A complete record,
    /// or a failed one still inside its backoff window, is returned unchanged.
    #[instrument(skip(self, spec, state, previous), fields(cluster = %spec.name, namespace = %spec.namespace))]
    pub async fn restore(
        &self,
        spec: &ClusterSpec,
        state: &ClusterState,
        previous: Option<&RestoreRecord>,
        now: DateTime<Utc>,
    ) -> RestoreRecord {
        let mut record = previous
            .filter(|r| r.cluster_uid == spec.uid)
            .cloned()
            .unwrap_or_else(|| RestoreRecord::pending(&spec.uid, &spec.restore_bucket));

        if record.is_complete() {
            return record;
        }
        if let Some(next) = record.next_attempt_at
            && now < next
        {
            return record;
        }

        if let Err(e) = record.advance(RestorePhase::Downloading) {
            warn!(error = %e, "restore record cannot start a new attempt");
            return record;
        }
        record.attempts = record.attempts.saturating_add(1);
        record.started_at = Some(now);
        record.resolved_bucket = spec.restore_bucket.clone();
        record.message = None;
        record.error_kind = None;
        record.next_attempt_at = None;
        info!(attempt = record.attempts, bucket = %record.resolved_bucket, "starting restore");

        let result = match tokio::time::timeout(
            self.restore_timeout,
            self.attempt(spec, state, &mut record),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::TransientInfraError(format!(
                "restore exceeded {}s and was cancelled",
                self.restore_timeout.as_secs()
            ))),
        };

        match result {
            Ok(()) => {
                record.completed_at = Some(now);
                info!(key = ?record.archive_key, "restore complete");
            }
            Err(e) => self.record_failure(&mut record, &e, now),
        }

        record
    }

    async fn attempt(
        &self,
        spec: &ClusterSpec,
        state: &ClusterState,
        record: &mut RestoreRecord,
    ) -> Result<()> {
        let target = restore_target(state)?;

        let key = match &spec.restore_from {
            Some(RestoreSource::Key(key)) => key.clone(),
            Some(RestoreSource::Latest) => {
                let prefix = listing_prefix(&spec.prefix);
                let keys = self
                    .storage
                    .list(spec, &spec.restore_bucket, &prefix)
                    .await?;
                select_latest(keys.iter().map(String::as_str)).ok_or_else(|| {
                    Error::TransientInfraError(format!(
                        "no archives under gs://{}/{}",
                        spec.restore_bucket, prefix
                    ))
                })?
            }
            None => {
                return Err(Error::ValidationError(
                    "restore requested without a restore source".to_string(),
                ));
            }
        };
        record.archive_key = Some(key.clone());
        info!(key = %key, member = %target.name, "downloading archive");

        let archive = self.storage.get(spec, &spec.restore_bucket, &key).await?;
        if archive.is_empty() {
            return Err(Error::DataIntegrityError(format!("archive {} is empty", key)));
        }

        let raw = decompress(&archive).map_err(|e| {
            Error::DataIntegrityError(format!("archive {} failed to decompress: {}", key, e))
        })?;
        if raw.is_empty() {
            return Err(Error::DataIntegrityError(format!(
                "archive {} decompressed to nothing",
                key
            )));
        }

        record.advance(RestorePhase::Applying)?;
        self.shell.restore(&spec.namespace, target, raw).await?;
        record.advance(RestorePhase::Complete)?;
        Ok(())
    }

    fn record_failure(&self, record: &mut RestoreRecord, error: &Error, now: DateTime<Utc>) {
        let kind = match error {
            Error::DataIntegrityError(_) => "DataIntegrity",
            Error::ValidationError(_) => "Validation",
            _ => "TransientInfra",
        };

        // Past the bound, retries continue at the maximum delay
        let delay = if record.attempts >= self.max_attempts {
            self.backoff.max_delay
        } else {
            self.backoff
                .delay_for_attempt(record.attempts.saturating_sub(1))
        };
        let next = chrono::Duration::from_std(delay)
            .map(|d| now + d)
            .unwrap_or(now);

        if let Err(e) = record.advance(RestorePhase::Failed) {
            warn!(error = %e, "could not mark restore record failed");
        }
        record.message = Some(error.to_string());
        record.error_kind = Some(kind.to_string());
        record.next_attempt_at = Some(next);

        warn!(
            attempt = record.attempts,
            error_kind = kind,
            error = %error,
            next_attempt_at = %next,
            "restore attempt failed"
        );
    }
}
