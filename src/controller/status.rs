//! Status and conditions management for MongoCluster resources
//!
//! The reconciler owns the topology fields and the conditions array of the
//! status. `status.restore` and `status.backup` belong to the restore
//! controller and the backup task, so patches built here never contain them.

use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::backup::restore::is_exhausted;
use crate::clock::Clock;
use crate::controller::Context;
use crate::controller::error::Result;
use crate::controller::normalize::ClusterSpec;
use crate::controller::planner::{PassOutcome, Step};
use crate::crd::{
    BackupPhase, BackupRecord, ClusterPhase, Condition, MongoCluster, MongoClusterStatus,
    RestorePhase, RestoreRecord,
};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Cluster is admitted and every member is healthy
    pub const READY: &str = "Ready";
    /// Cluster is progressing towards a goal state
    pub const PROGRESSING: &str = "Progressing";
    /// Majority lost or restore retries exhausted
    pub const DEGRADED: &str = "Degraded";
    /// Cluster configuration is valid
    pub const CONFIG_VALID: &str = "ConfigurationValid";
    /// The configured archive has been loaded
    pub const RESTORED: &str = "Restored";
    /// Outcome of the most recent backup
    pub const BACKUP_SUCCEEDED: &str = "BackupSucceeded";
    /// Membership changes keep a healthy majority
    pub const QUORUM_SAFE: &str = "QuorumSafe";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    ///
    /// The transition time only moves when the status value changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Set the Ready condition
    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    /// Set the Progressing condition
    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            bool_status(is_progressing),
            reason,
            message,
        )
    }

    /// Set the Degraded condition
    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::DEGRADED, bool_status(is_degraded), reason, message)
    }

    pub fn config_valid(self, is_valid: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::CONFIG_VALID, bool_status(is_valid), reason, message)
    }

    pub fn quorum_safe(self, is_safe: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::QUORUM_SAFE, bool_status(is_safe), reason, message)
    }

    /// Set the Restored condition from the restore record of this cluster
    pub fn restored(self, record: Option<&RestoreRecord>) -> Self {
        let (status, reason, message) = match record {
            Some(r) if r.is_complete() => (
                condition_status::TRUE,
                "RestoreComplete".to_string(),
                format!(
                    "restored {} from {}",
                    r.archive_key.as_deref().unwrap_or("archive"),
                    r.resolved_bucket
                ),
            ),
            Some(r) if r.status == RestorePhase::Failed => (
                condition_status::FALSE,
                r.error_kind.clone().unwrap_or_else(|| "RestoreFailed".to_string()),
                format!(
                    "attempt {} failed: {}",
                    r.attempts,
                    r.message.as_deref().unwrap_or("unknown error")
                ),
            ),
            Some(r) => (
                condition_status::FALSE,
                "RestoreInProgress".to_string(),
                format!("restore is {}", r.status),
            ),
            None => (
                condition_status::FALSE,
                "RestorePending".to_string(),
                "waiting for the replica set before restoring".to_string(),
            ),
        };
        self.set_condition(condition_types::RESTORED, status, &reason, &message)
    }

    /// Set the BackupSucceeded condition from the most recent backup record
    pub fn backup_succeeded(self, last: &BackupRecord) -> Self {
        match last.status {
            BackupPhase::Complete => {
                let message = format!(
                    "gs://{}/{} ({} bytes)",
                    last.bucket,
                    last.archive_key,
                    last.size_bytes.unwrap_or_default()
                );
                self.set_condition(
                    condition_types::BACKUP_SUCCEEDED,
                    condition_status::TRUE,
                    "BackupComplete",
                    &message,
                )
            }
            BackupPhase::Failed => {
                let message = last.message.as_deref().unwrap_or("backup failed");
                self.set_condition(
                    condition_types::BACKUP_SUCCEEDED,
                    condition_status::FALSE,
                    "BackupFailed",
                    message,
                )
            }
            BackupPhase::Pending | BackupPhase::Uploading => self.set_condition(
                condition_types::BACKUP_SUCCEEDED,
                condition_status::UNKNOWN,
                "BackupInProgress",
                &format!("backup {} is {}", last.id, last.status),
            ),
        }
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// When the current phase was entered; kept while the phase is unchanged
pub fn phase_started_at(
    existing: Option<&MongoClusterStatus>,
    phase: ClusterPhase,
    now: DateTime<Utc>,
) -> Option<String> {
    match existing {
        Some(s) if s.phase == phase && s.phase_started_at.is_some() => s.phase_started_at.clone(),
        _ => Some(now.to_rfc3339()),
    }
}

/// Status after a successful reconcile pass
///
/// `restore` and `backup` are carried over from the existing status (or the
/// record the pass just produced) so the result can be compared with what is
/// stored; they are not part of the reconciler's patch.
pub fn pass_status(
    cluster: &MongoCluster,
    spec: &ClusterSpec,
    outcome: &PassOutcome,
    restore_max_attempts: u32,
    now: DateTime<Utc>,
) -> MongoClusterStatus {
    let existing = cluster.status.as_ref();
    let generation = cluster.metadata.generation;
    let state = &outcome.state;

    let restore = outcome
        .restore
        .clone()
        .or_else(|| existing.and_then(|s| s.restore.clone()));
    let own_restore = restore.as_ref().filter(|r| r.cluster_uid == spec.uid);
    let backup = existing.and_then(|s| s.backup.clone());

    let ready = outcome.phase == ClusterPhase::Steady
        && outcome.admitted
        && state.member_count() > 0
        && state.all_healthy();
    let ready_message = if ready {
        format!(
            "{}/{} members healthy, primary {}",
            state.healthy_count(),
            state.member_count(),
            state.primary.as_deref().unwrap_or("unknown")
        )
    } else {
        outcome.step.to_string()
    };

    let (progressing, progressing_reason) = match &outcome.step {
        Step::Noop => (false, "Stable"),
        Step::AbortScaling(_) => (false, "Blocked"),
        Step::Wait(_) | Step::AwaitRestore { .. } => (true, "Waiting"),
        _ => (true, "Reconciling"),
    };

    let degraded = outcome.phase == ClusterPhase::Degraded;
    let (degraded_reason, degraded_message) = if !degraded {
        ("Healthy", "cluster is healthy".to_string())
    } else if !outcome.admitted && own_restore.is_some_and(|r| is_exhausted(r, restore_max_attempts)) {
        ("RestoreExhausted", "restore retries exhausted, retrying at maximum backoff".to_string())
    } else {
        (
            "MajorityUnavailable",
            format!(
                "{}/{} members healthy",
                state.healthy_count(),
                state.member_count()
            ),
        )
    };

    let (quorum_safe, quorum_reason, quorum_message) = match (&outcome.step, outcome.quorum_blocked_generation) {
        (Step::AbortScaling(reason), _) => (false, "QuorumRisk", reason.clone()),
        (_, Some(g)) => (
            false,
            "QuorumRisk",
            format!("scaling aborted for generation {}; change the spec to retry", g),
        ),
        _ if !state.has_majority() && state.member_count() > 0 => (
            false,
            "MajorityUnavailable",
            format!(
                "{}/{} members healthy",
                state.healthy_count(),
                state.member_count()
            ),
        ),
        _ => (true, "QuorumHealthy", "a healthy majority is available".to_string()),
    };

    let mut builder = ConditionBuilder::from_existing(
        existing.map(|s| s.conditions.clone()).unwrap_or_default(),
        generation,
    )
    .ready(ready, if ready { "ClusterReady" } else { phase_reason(outcome.phase) }, &ready_message)
    .progressing(progressing, progressing_reason, &outcome.step.to_string())
    .degraded(degraded, degraded_reason, &degraded_message)
    .config_valid(true, "Valid", "spec is valid")
    .quorum_safe(quorum_safe, quorum_reason, &quorum_message);

    if spec.restore_from.is_some() {
        builder = builder.restored(own_restore);
    }
    if let Some(last) = backup.as_ref().and_then(|b| b.last.as_ref()) {
        builder = builder.backup_succeeded(last);
    }

    MongoClusterStatus {
        phase: outcome.phase,
        ready_members: state.healthy_count(),
        members: state.member_names(),
        primary: state.primary.clone(),
        admitted: outcome.admitted,
        quorum_blocked_generation: outcome.quorum_blocked_generation,
        observed_generation: generation,
        conditions: builder.build(),
        last_error: None,
        last_error_time: None,
        phase_started_at: phase_started_at(existing, outcome.phase, now),
        restore,
        backup,
    }
}

fn phase_reason(phase: ClusterPhase) -> &'static str {
    match phase {
        ClusterPhase::Bootstrapping => "Bootstrapping",
        ClusterPhase::Restoring => "Restoring",
        ClusterPhase::Steady => "NotAdmitted",
        ClusterPhase::Scaling => "Scaling",
        ClusterPhase::Degraded => "Degraded",
    }
}

/// Whether the reconciler-owned part of the status differs
pub fn owned_status_changed(existing: Option<&MongoClusterStatus>, new: &MongoClusterStatus) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    let strip = |s: &MongoClusterStatus| MongoClusterStatus {
        restore: None,
        backup: None,
        ..s.clone()
    };
    strip(existing) != strip(new)
}

/// Merge patch body for the reconciler-owned fields
///
/// Optional fields that are unset are sent as `null` so the merge clears
/// them, and the fields owned by other writers are left out entirely.
pub fn owned_status_patch(status: &MongoClusterStatus) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(status)?;
    if let Some(fields) = value.as_object_mut() {
        fields.remove("restore");
        fields.remove("backup");
        for clearable in [
            "members",
            "primary",
            "quorumBlockedGeneration",
            "conditions",
            "lastError",
            "lastErrorTime",
        ] {
            fields
                .entry(clearable)
                .or_insert(serde_json::Value::Null);
        }
    }
    Ok(serde_json::json!({ "status": value }))
}

/// Status manager for MongoCluster resources
pub struct StatusManager<'a> {
    cluster: &'a MongoCluster,
    ctx: &'a Context,
    ns: &'a str,
}

impl<'a> StatusManager<'a> {
    /// Create a new status manager
    pub fn new(cluster: &'a MongoCluster, ctx: &'a Context, ns: &'a str) -> Self {
        Self { cluster, ctx, ns }
    }

    /// Patch the reconciler-owned fields, skipping the write when nothing changed
    pub async fn update(&self, status: MongoClusterStatus) -> Result<()> {
        if !owned_status_changed(self.cluster.status.as_ref(), &status) {
            debug!("status unchanged, skipping patch");
            return Ok(());
        }

        let api: Api<MongoCluster> = Api::namespaced(self.ctx.client.clone(), self.ns);
        let patch = owned_status_patch(&status)?;
        api.patch_status(
            &self.cluster.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }

    /// Record a successful reconcile pass
    pub async fn set_pass(
        &self,
        spec: &ClusterSpec,
        outcome: &PassOutcome,
        restore_max_attempts: u32,
    ) -> Result<()> {
        let status = pass_status(
            self.cluster,
            spec,
            outcome,
            restore_max_attempts,
            self.ctx.clock.now(),
        );
        self.update(status).await
    }

    /// Record a spec that failed validation
    pub async fn set_invalid(&self, message: &str) -> Result<()> {
        let existing = self.cluster.status.clone().unwrap_or_default();
        let conditions = ConditionBuilder::from_existing(
            existing.conditions.clone(),
            self.cluster.metadata.generation,
        )
        .config_valid(false, "InvalidSpec", message)
        .ready(false, "InvalidSpec", message)
        .progressing(false, "InvalidSpec", "waiting for a valid spec")
        .build();

        self.update(MongoClusterStatus {
            observed_generation: self.cluster.metadata.generation,
            conditions,
            last_error: Some(message.to_string()),
            last_error_time: Some(self.ctx.clock.now().to_rfc3339()),
            ..existing
        })
        .await
    }

    /// Record a failed reconcile pass; the phase is left as it was
    pub async fn set_failed(&self, reason: &str, message: &str) -> Result<()> {
        let existing = self.cluster.status.clone().unwrap_or_default();
        let conditions = ConditionBuilder::from_existing(
            existing.conditions.clone(),
            self.cluster.metadata.generation,
        )
        .ready(false, reason, message)
        .progressing(false, "Failed", message)
        .build();

        self.update(MongoClusterStatus {
            conditions,
            last_error: Some(message.to_string()),
            last_error_time: Some(self.ctx.clock.now().to_rfc3339()),
            ..existing
        })
        .await
    }

    /// Update status for a deleting cluster
    pub async fn set_deleting(&self) -> Result<()> {
        let existing = self.cluster.status.clone().unwrap_or_default();
        let conditions = ConditionBuilder::from_existing(
            existing.conditions.clone(),
            self.cluster.metadata.generation,
        )
        .ready(false, "Deleting", "Cluster is being deleted")
        .progressing(true, "Terminating", "Cluster resources are being cleaned up")
        .build();

        self.update(MongoClusterStatus {
            conditions,
            ..existing
        })
        .await
    }
}

/// Check if the cluster spec has changed by comparing observed generation
pub fn spec_changed(cluster: &MongoCluster) -> bool {
    let current_generation = cluster.metadata.generation;
    let observed_generation = cluster.status.as_ref().and_then(|s| s.observed_generation);

    match (current_generation, observed_generation) {
        (Some(current), Some(observed)) => current != observed,
        (Some(_), None) => true, // Never observed, needs reconciliation
        _ => true,               // No generation, always reconcile
    }
}
