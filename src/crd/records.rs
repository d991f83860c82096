//! Backup and restore records persisted in the MongoCluster status
//!
//! Both record types are append-only logs from the point of view of their
//! owners: a backup record never changes once it reaches a terminal state,
//! and a restore record never leaves `Complete`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when a record is moved through an invalid transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record {id} is terminal ({from}) and cannot move to {to}")]
    Terminal {
        id: String,
        from: String,
        to: String,
    },

    #[error("record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },
}

/// Lifecycle of a single backup run
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum BackupPhase {
    Pending,
    Uploading,
    Complete,
    Failed,
}

impl BackupPhase {
    /// Complete and Failed records are immutable
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupPhase::Complete | BackupPhase::Failed)
    }
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupPhase::Pending => write!(f, "Pending"),
            BackupPhase::Uploading => write!(f, "Uploading"),
            BackupPhase::Complete => write!(f, "Complete"),
            BackupPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// One backup run, created when a scheduler slot fires
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Unique id, derived from the cluster name and slot time
    pub id: String,

    /// Scheduler slot that triggered this run
    pub created_at: DateTime<Utc>,

    /// Member the snapshot was taken from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_member: Option<String>,

    /// Destination bucket
    pub bucket: String,

    /// Final object key of the archive
    pub archive_key: String,

    /// Compressed archive size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    pub status: BackupPhase,

    /// Failure detail or completion note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackupRecord {
    /// Create a pending record for a slot
    pub fn pending(
        id: impl Into<String>,
        bucket: impl Into<String>,
        archive_key: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            created_at,
            source_member: None,
            bucket: bucket.into(),
            archive_key: archive_key.into(),
            size_bytes: None,
            status: BackupPhase::Pending,
            message: None,
            finished_at: None,
        }
    }

    /// Move the record to a new phase
    ///
    /// Pending -> Uploading -> Complete, and any non-terminal phase -> Failed.
    pub fn advance(&mut self, to: BackupPhase) -> Result<(), RecordError> {
        if self.status.is_terminal() {
            return Err(RecordError::Terminal {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let allowed = matches!(
            (self.status, to),
            (BackupPhase::Pending, BackupPhase::Uploading)
                | (BackupPhase::Uploading, BackupPhase::Complete)
                | (_, BackupPhase::Failed)
        );
        if !allowed {
            return Err(RecordError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        self.status = to;
        Ok(())
    }

    /// Mark the record complete after storage acknowledged the upload
    pub fn complete(&mut self, size_bytes: u64, at: DateTime<Utc>) -> Result<(), RecordError> {
        self.advance(BackupPhase::Complete)?;
        self.size_bytes = Some(size_bytes);
        self.finished_at = Some(at);
        Ok(())
    }

    /// Mark the record failed
    pub fn fail(&mut self, message: impl Into<String>, at: DateTime<Utc>) -> Result<(), RecordError> {
        self.advance(BackupPhase::Failed)?;
        self.message = Some(message.into());
        self.finished_at = Some(at);
        Ok(())
    }
}

/// Lifecycle of the one-time restore
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum RestorePhase {
    Pending,
    Downloading,
    Applying,
    Complete,
    Failed,
}

impl std::fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestorePhase::Pending => write!(f, "Pending"),
            RestorePhase::Downloading => write!(f, "Downloading"),
            RestorePhase::Applying => write!(f, "Applying"),
            RestorePhase::Complete => write!(f, "Complete"),
            RestorePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Restore bookkeeping for a cluster identity
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRecord {
    /// `metadata.uid` of the cluster this restore belongs to
    pub cluster_uid: String,

    /// Resolved archive key (set once "latest" has been resolved)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_key: Option<String>,

    /// Bucket the archive is read from
    pub resolved_bucket: String,

    pub status: RestorePhase,

    /// Number of attempts started so far
    #[serde(default)]
    pub attempts: u32,

    /// Failure detail from the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Error class of the last failure (e.g. "DataIntegrity")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Earliest time the next attempt may start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl RestoreRecord {
    pub fn pending(cluster_uid: impl Into<String>, resolved_bucket: impl Into<String>) -> Self {
        Self {
            cluster_uid: cluster_uid.into(),
            archive_key: None,
            resolved_bucket: resolved_bucket.into(),
            status: RestorePhase::Pending,
            attempts: 0,
            message: None,
            error_kind: None,
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == RestorePhase::Complete
    }

    /// Move the record to a new phase
    ///
    /// A failed attempt may start over at Downloading; Complete is final.
    pub fn advance(&mut self, to: RestorePhase) -> Result<(), RecordError> {
        if self.is_complete() {
            return Err(RecordError::Terminal {
                id: self.cluster_uid.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let allowed = matches!(
            (self.status, to),
            (RestorePhase::Pending | RestorePhase::Failed, RestorePhase::Downloading)
                | (RestorePhase::Downloading, RestorePhase::Applying)
                | (RestorePhase::Applying, RestorePhase::Complete)
                | (_, RestorePhase::Failed)
        );
        if !allowed {
            return Err(RecordError::InvalidTransition {
                id: self.cluster_uid.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        self.status = to;
        Ok(())
    }
}
