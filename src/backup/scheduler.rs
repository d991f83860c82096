//! Backup scheduler
//!
//! The scheduler keeps no timers of its own. Each poll loads the persisted
//! fire time, compares the next cron boundary with the injected clock and
//! fires at most once per slot. The slot is persisted before the executor
//! runs, so a restart in the middle of a backup never produces a second
//! record for the same slot. Missed slots are not backfilled: a boundary
//! that passed more than the grace window ago is recorded and skipped, and
//! the next fire happens at the next occurring boundary.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument};

use crate::backup::cron::CronExpr;
use crate::backup::executor::{BackupExecutor, pending_record};
use crate::clock::Clock;
use crate::controller::cluster_state::ClusterState;
use crate::controller::error::Result;
use crate::controller::normalize::ClusterSpec;
use crate::crd::BackupRecord;

/// How late a poll may notice a boundary and still fire for it
pub const DEFAULT_FIRE_GRACE: Duration = Duration::minutes(5);

/// Persisted time of the last slot the scheduler accounted for
#[async_trait]
pub trait FireTimeStore: Send + Sync {
    async fn last_fire(&self, spec: &ClusterSpec) -> Result<Option<DateTime<Utc>>>;

    async fn record_fire(&self, spec: &ClusterSpec, slot: DateTime<Utc>) -> Result<()>;
}

/// Persisted backup records
#[async_trait]
pub trait BackupLedger: Send + Sync {
    /// Insert or replace the record with the same id
    async fn append(&self, spec: &ClusterSpec, record: &BackupRecord) -> Result<()>;
}

/// What a poll decided to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollDecision {
    /// Nothing recorded yet; `now` becomes the anchor and nothing fires
    Anchored(DateTime<Utc>),
    /// The next boundary is still ahead
    NotDue { next: Option<DateTime<Utc>> },
    /// Fire for `slot`, the latest boundary at or before now
    Fire { slot: DateTime<Utc> },
    /// `slot` passed longer ago than the grace window; record it without firing
    Missed {
        slot: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    },
}

/// The next boundary strictly after `last_fire`, or after `now` without one
pub fn due_at(
    cron: &CronExpr,
    now: DateTime<Utc>,
    last_fire: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    cron.next_after(last_fire.unwrap_or(now))
}

pub fn decide(
    cron: &CronExpr,
    now: DateTime<Utc>,
    last_fire: Option<DateTime<Utc>>,
    grace: Duration,
) -> PollDecision {
    let Some(last) = last_fire else {
        return PollDecision::Anchored(now);
    };

    match due_at(cron, now, Some(last)) {
        Some(due) if due <= now => {
            let slot = cron.latest_at_or_before(last, now).unwrap_or(due);
            if now - slot <= grace {
                PollDecision::Fire { slot }
            } else {
                PollDecision::Missed {
                    slot,
                    next: cron.next_after(now),
                }
            }
        }
        next => PollDecision::NotDue { next },
    }
}

pub struct BackupScheduler {
    store: Arc<dyn FireTimeStore>,
    ledger: Arc<dyn BackupLedger>,
    executor: Arc<BackupExecutor>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl BackupScheduler {
    pub fn new(
        store: Arc<dyn FireTimeStore>,
        ledger: Arc<dyn BackupLedger>,
        executor: Arc<BackupExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            executor,
            clock,
            grace: DEFAULT_FIRE_GRACE,
        }
    }

    /// Set the grace window; it should cover at least one poll interval
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Poll one cluster
    ///
    /// `state` is the snapshot last published by the reconciler and
    /// `admitted` whether the cluster serves traffic. A slot that comes due
    /// before admission is consumed without a backup, since the data set is
    /// still being bootstrapped or restored. An admitted cluster without a
    /// published snapshot leaves the slot unclaimed so a later poll fires it.
    #[instrument(skip(self, spec, state), fields(cluster = %spec.name, namespace = %spec.namespace))]
    pub async fn poll(
        &self,
        spec: &ClusterSpec,
        state: Option<ClusterState>,
        admitted: bool,
    ) -> Result<Option<BackupRecord>> {
        let now = self.clock.now();
        let last = self.store.last_fire(spec).await?;

        let slot = match decide(&spec.backup_cron, now, last, self.grace) {
            PollDecision::Anchored(at) => {
                info!(cron = %spec.backup_cron, anchor = %at, "anchoring backup schedule");
                self.store.record_fire(spec, at).await?;
                return Ok(None);
            }
            PollDecision::NotDue { next } => {
                debug!(next = ?next, "backup not due");
                return Ok(None);
            }
            PollDecision::Missed { slot, next } => {
                info!(slot = %slot, next = ?next, "backup slot missed, waiting for the next one");
                self.store.record_fire(spec, slot).await?;
                return Ok(None);
            }
            PollDecision::Fire { slot } => slot,
        };

        if !admitted {
            info!(slot = %slot, "cluster not admitted yet, skipping backup slot");
            self.store.record_fire(spec, slot).await?;
            return Ok(None);
        }

        let Some(state) = state else {
            debug!(slot = %slot, "no published cluster state yet, backup deferred");
            return Ok(None);
        };

        self.store.record_fire(spec, slot).await?;

        info!(slot = %slot, "backup slot due");
        self.ledger.append(spec, &pending_record(spec, slot)).await?;
        let record = self.executor.execute(&state, spec, slot).await;
        self.ledger.append(spec, &record).await?;

        Ok(Some(record))
    }
}
