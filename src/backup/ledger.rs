//! Persistence of backup and restore bookkeeping in the MongoCluster status
//!
//! Each writer merge-patches only the status field it owns: the backup task
//! writes `status.backup`, the restore controller writes `status.restore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use crate::backup::scheduler::{BackupLedger, FireTimeStore};
use crate::controller::error::Result;
use crate::controller::normalize::ClusterSpec;
use crate::crd::{BackupRecord, MongoCluster, RestoreRecord};

/// Number of backup records kept in `status.backup.history`
pub const HISTORY_LIMIT: usize = 10;

/// Insert or replace `record` by id, keeping the newest `HISTORY_LIMIT` entries
pub fn record_history(history: &mut Vec<BackupRecord>, record: &BackupRecord) {
    match history.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record.clone(),
        None => history.push(record.clone()),
    }
    if history.len() > HISTORY_LIMIT {
        let excess = history.len() - HISTORY_LIMIT;
        history.drain(..excess);
    }
}

/// Status-backed store for scheduler fire times and backup/restore records
#[derive(Clone)]
pub struct StatusLedger {
    client: Client,
}

impl StatusLedger {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<MongoCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_status(&self, spec: &ClusterSpec, status: serde_json::Value) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api(&spec.namespace)
            .patch_status(&spec.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Persist the restore record; owned by the restore controller
    pub async fn save_restore(&self, spec: &ClusterSpec, record: &RestoreRecord) -> Result<()> {
        self.patch_status(spec, serde_json::json!({ "restore": record }))
            .await
    }
}

#[async_trait]
impl FireTimeStore for StatusLedger {
    async fn last_fire(&self, spec: &ClusterSpec) -> Result<Option<DateTime<Utc>>> {
        let cluster = self.api(&spec.namespace).get(&spec.name).await?;
        Ok(cluster
            .status
            .and_then(|s| s.backup)
            .and_then(|b| b.last_scheduled_time))
    }

    async fn record_fire(&self, spec: &ClusterSpec, slot: DateTime<Utc>) -> Result<()> {
        self.patch_status(
            spec,
            serde_json::json!({ "backup": { "lastScheduledTime": slot } }),
        )
        .await
    }
}

#[async_trait]
impl BackupLedger for StatusLedger {
    async fn append(&self, spec: &ClusterSpec, record: &BackupRecord) -> Result<()> {
        let cluster = self.api(&spec.namespace).get(&spec.name).await?;
        let mut history = cluster
            .status
            .and_then(|s| s.backup)
            .map(|b| b.history)
            .unwrap_or_default();
        record_history(&mut history, record);

        self.patch_status(
            spec,
            serde_json::json!({ "backup": { "last": record, "history": history } }),
        )
        .await
    }
}
