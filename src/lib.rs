pub mod backup;
pub mod clock;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod storage;

pub use config::OperatorConfig;
pub use controller::{BackoffConfig, Context, Error, FINALIZER, Result, error_policy, reconcile};
pub use crd::MongoCluster;
pub use health::{HealthState, Metrics};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::ListParams;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::time::MissedTickBehavior;

use crate::backup::scheduler::DEFAULT_FIRE_GRACE;
use crate::backup::{BackupExecutor, BackupScheduler, StatusLedger, StorageAccess};
use crate::clock::{Clock, SystemClock};
use crate::controller::backend::DatabaseShell;
use crate::controller::cluster_state::ClusterStateStore;
use crate::controller::error::ErrorContext;
use crate::controller::normalize::normalize;
use crate::crd::{BackupPhase, ClusterPhase};
use crate::resources::mongo_shell::KubeMongoShell;
use crate::storage::{GcsStorage, ServiceAccountResolver, StorageError};

/// Consecutive poll failures of one cluster before they are logged as errors
const BACKUP_POLL_ERROR_THRESHOLD: u32 = 3;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Storage access backed by GCS and service-account secrets
pub fn storage_access(client: Client, config: &OperatorConfig) -> Result<StorageAccess, StorageError> {
    let http = reqwest::Client::builder()
        .timeout(config.storage_timeout)
        .build()
        .map_err(|e| StorageError::Invalid(format!("failed to build http client: {}", e)))?;

    Ok(StorageAccess::new(
        Arc::new(GcsStorage::new(http.clone())?),
        Arc::new(ServiceAccountResolver::new(client, http)),
        config.storage_timeout,
        config.transient_max_attempts,
    ))
}

/// Run the operator controller with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
pub async fn run_controller_scoped(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    config: Arc<OperatorConfig>,
    state_store: ClusterStateStore,
    storage: StorageAccess,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for MongoCluster resources (scope: {})",
        scope_msg
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(
        client.clone(),
        health_state,
        config,
        state_store,
        storage,
    ));

    let clusters: Api<MongoCluster> = scoped_api(client.clone(), namespace);
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let secrets: Api<Secret> = scoped_api(client.clone(), namespace);
    let pdbs: Api<PodDisruptionBudget> = scoped_api(client.clone(), namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    // Watch MongoCluster and all owned resources to trigger reconciliation
    Controller::new(clusters, watcher_config.clone())
        .owns(statefulsets, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .owns(secrets, watcher_config.clone())
        .owns(pdbs, watcher_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // Watch events for owned objects can outlive the cluster itself
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::error!("Controller stream ended unexpectedly");
}

/// Run the backup scheduler over every MongoCluster in scope.
///
/// Clusters are polled one after another on a fixed interval. A failure in
/// one cluster is logged and does not affect the others.
pub async fn run_backup_scheduler(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    config: Arc<OperatorConfig>,
    state_store: ClusterStateStore,
    storage: StorageAccess,
) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let shell: Arc<dyn DatabaseShell> = Arc::new(KubeMongoShell::new(client.clone()));
    let ledger = Arc::new(StatusLedger::new(client.clone()));
    let executor = Arc::new(BackupExecutor::new(
        shell,
        storage,
        clock.clone(),
        config.backup_timeout,
    ));
    let grace = chrono::Duration::from_std(config.backup_poll_interval * 2)
        .map_or(DEFAULT_FIRE_GRACE, |window| window.max(DEFAULT_FIRE_GRACE));
    let scheduler =
        BackupScheduler::new(ledger.clone(), ledger, executor, clock).with_grace(grace);

    let clusters: Api<MongoCluster> = scoped_api(client, config.watch_namespace.as_deref());
    let mut failures: HashMap<String, ErrorContext> = HashMap::new();

    tracing::info!(
        interval = ?config.backup_poll_interval,
        "Starting backup scheduler"
    );

    let mut ticker = tokio::time::interval(config.backup_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let list = match clusters.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list MongoCluster resources");
                continue;
            }
        };

        if let Some(health) = &health_state {
            record_fleet_phases(health, &list.items);
        }

        prune_failures(&mut failures, &list.items);

        for cluster in &list.items {
            if cluster.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let ns = cluster.namespace().unwrap_or_default();
            let name = cluster.name_any();
            let key = ClusterStateStore::key(&ns, &name);

            let spec = match normalize(cluster) {
                Ok(spec) => spec,
                Err(e) => {
                    tracing::debug!(cluster = %name, error = %e, "skipping invalid cluster");
                    continue;
                }
            };

            let snapshot = state_store.snapshot(&ns, &name).await;
            let admitted = cluster.status.as_ref().is_some_and(|s| s.admitted);

            match scheduler.poll(&spec, snapshot, admitted).await {
                Ok(record) => {
                    failures.remove(&key);
                    if let (Some(record), Some(health)) = (record, &health_state) {
                        health.metrics.record_backup(
                            &ns,
                            &name,
                            record.status == BackupPhase::Complete,
                        );
                    }
                }
                Err(e) => {
                    let failure = failures.entry(key).or_default();
                    failure.record_error(&e);
                    if failure.exceeded_max_retries(BACKUP_POLL_ERROR_THRESHOLD) {
                        tracing::error!(
                            cluster = %name,
                            namespace = %ns,
                            consecutive = failure.consecutive_errors,
                            error = %e,
                            "backup poll keeps failing"
                        );
                    } else {
                        tracing::warn!(cluster = %name, namespace = %ns, error = %e, "backup poll failed");
                    }
                }
            }
        }
    }
}

/// Forget failure streaks of clusters that are no longer listed
fn prune_failures(failures: &mut HashMap<String, ErrorContext>, clusters: &[MongoCluster]) {
    let live: HashSet<String> = clusters
        .iter()
        .map(|c| ClusterStateStore::key(&c.namespace().unwrap_or_default(), &c.name_any()))
        .collect();
    failures.retain(|key, _| live.contains(key));
}

fn record_fleet_phases(health: &HealthState, clusters: &[MongoCluster]) {
    let mut counts: HashMap<ClusterPhase, i64> = [
        ClusterPhase::Bootstrapping,
        ClusterPhase::Restoring,
        ClusterPhase::Steady,
        ClusterPhase::Scaling,
        ClusterPhase::Degraded,
    ]
    .into_iter()
    .map(|phase| (phase, 0))
    .collect();

    for cluster in clusters {
        let phase = cluster.status.as_ref().map(|s| s.phase).unwrap_or_default();
        *counts.entry(phase).or_default() += 1;
    }
    for (phase, count) in counts {
        health.metrics.set_clusters_by_phase(&phase.to_string(), count);
    }
}
