//! Reconciliation logic for MongoCluster resources
//!
//! Each pass normalizes the spec, makes sure the supporting resources exist,
//! then hands over to the planner which observes the members and executes a
//! single step. Observed state is published for the backup task and the
//! reconciler-owned part of the status is patched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::normalize::{ClusterSpec, diff, normalize};
use crate::controller::planner::{PassInput, run_pass};
use crate::controller::status::StatusManager;
use crate::crd::MongoCluster;
use crate::resources::common::FIELD_MANAGER;
use crate::resources::{pdb, secret, service, statefulset};

/// Finalizer name for cleanup
pub const FINALIZER: &str = "operators.ultimaker.com/finalizer";

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<MongoCluster>, ctx: Arc<Context>) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let start = Instant::now();

    debug!("Reconciling MongoCluster");

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &ctx, &ns).await;
    }

    if !has_finalizer(&cluster) {
        add_finalizer(&cluster, &ctx, &ns).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let result = reconcile_cluster(&cluster, &ctx, &ns).await;
    match &result {
        Ok(_) => ctx.record_reconcile(&ns, &name, start.elapsed().as_secs_f64()),
        Err(e) => {
            ctx.record_error(&ns, &name);
            if !e.is_not_found() {
                let status_manager = StatusManager::new(&cluster, &ctx, &ns);
                if let Err(status_err) = status_manager.set_failed(e.reason(), &e.to_string()).await {
                    warn!(error = %status_err, "failed to record reconcile error in status");
                }
            }
        }
    }
    result
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<MongoCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    let delay = BackoffConfig::default().delay_for_error(error, 0);

    if error.is_retryable() {
        warn!(cluster = %name, error = %error, delay = ?delay, "retryable error, requeuing");
    } else {
        error!(
            cluster = %name,
            error = %error,
            delay = ?delay,
            "non-retryable error, requeuing for manual intervention"
        );
    }

    Action::requeue(delay)
}

async fn reconcile_cluster(cluster: &MongoCluster, ctx: &Context, ns: &str) -> Result<Action> {
    let name = cluster.name_any();
    let status_manager = StatusManager::new(cluster, ctx, ns);

    let spec = match normalize(cluster) {
        Ok(spec) => spec,
        Err(e @ Error::ValidationError(_)) => {
            warn!(error = %e, "spec rejected");
            status_manager.set_invalid(&e.to_string()).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    if let Some(previous) = ctx.accept_spec(&spec).await {
        let changes = diff(&previous, &spec);
        if changes.has_changes() {
            info!(
                replica_delta = changes.replica_delta,
                rolling_update = changes.requires_rolling_update(),
                backup_changed = changes.backup_changed,
                "spec changed"
            );
        }
    }

    ensure_resources(ctx, &spec).await?;

    let status = cluster.status.clone().unwrap_or_default();
    let outcome = run_pass(
        PassInput {
            spec: &spec,
            phase: status.phase,
            restore: status.restore.as_ref(),
            admitted: status.admitted,
            quorum_blocked_generation: status.quorum_blocked_generation,
        },
        ctx.backend.as_ref(),
        &ctx.restorer,
        ctx.clock.now(),
    )
    .await?;

    ctx.state_store
        .publish(ns, &name, outcome.state.clone())
        .await;

    if let Some(record) = &outcome.restore {
        ctx.ledger.save_restore(&spec, record).await?;
        if let Some(health) = &ctx.health_state {
            health.metrics.record_restore(ns, &name, record.is_complete());
        }
    }

    status_manager
        .set_pass(&spec, &outcome, ctx.restorer.max_attempts())
        .await?;

    if let Some(health) = &ctx.health_state {
        health.metrics.set_cluster_replicas(
            ns,
            &name,
            i64::from(spec.replicas),
            i64::from(outcome.state.healthy_count()),
        );
    }

    debug!(phase = %outcome.phase, requeue = ?outcome.requeue, "pass complete");
    Ok(Action::requeue(outcome.requeue))
}

/// Admin secret, headless service, PDB and StatefulSet
///
/// The StatefulSet is applied with the replica count it already has; only
/// the planner moves it, one member at a time.
async fn ensure_resources(ctx: &Context, spec: &ClusterSpec) -> Result<()> {
    ensure_admin_secret(ctx, spec).await?;
    apply_resource(ctx, &spec.namespace, &service::generate_headless_service(spec)).await?;
    apply_resource(ctx, &spec.namespace, &pdb::generate_pdb(spec)).await?;

    let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &spec.namespace);
    let replicas = sts_api
        .get_opt(&spec.name)
        .await?
        .and_then(|sts| sts.spec)
        .and_then(|s| s.replicas)
        .unwrap_or(0);
    let sts = statefulset::generate_statefulset(
        spec,
        &ctx.config.mongo_image,
        &ctx.config.storage_size,
        replicas,
    );
    apply_resource(ctx, &spec.namespace, &sts).await
}

/// The admin password is generated once and never rotated
async fn ensure_admin_secret(ctx: &Context, spec: &ClusterSpec) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &spec.namespace);
    let name = secret::admin_secret_name(&spec.name);
    if api.get_opt(&name).await?.is_some() {
        return Ok(());
    }

    match api
        .create(&PostParams::default(), &secret::generate_admin_secret(spec))
        .await
    {
        Ok(_) => {
            info!(secret = %name, "created admin credentials");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Apply a Kubernetes resource using server-side apply
async fn apply_resource<T>(ctx: &Context, ns: &str, resource: &T) -> Result<()>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + serde::Serialize
        + DeserializeOwned
        + Clone
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(ctx.client.clone(), ns);
    let name = resource.name_any();

    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&name, &params, &Patch::Apply(resource)).await?;
    debug!("Applied resource: {}", name);

    Ok(())
}

/// Check if the finalizer is present
fn has_finalizer(cluster: &MongoCluster) -> bool {
    cluster
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
}

/// Add the finalizer to the resource
async fn add_finalizer(cluster: &MongoCluster, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<MongoCluster> = Api::namespaced(ctx.client.clone(), ns);
    let name = cluster.name_any();

    let mut finalizers = cluster.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });

    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    info!("Added finalizer to {}", name);
    Ok(())
}

/// Handle deletion of the MongoCluster
///
/// Owned resources are garbage collected through their owner references.
/// Archives in object storage are left in place.
async fn handle_deletion(cluster: &MongoCluster, ctx: &Context, ns: &str) -> Result<Action> {
    let name = cluster.name_any();
    info!("Handling deletion of {}", name);

    let status_manager = StatusManager::new(cluster, ctx, ns);
    if let Err(e) = status_manager.set_deleting().await {
        debug!(error = %e, "could not mark cluster as deleting");
    }

    ctx.state_store.remove(ns, &name).await;
    ctx.forget_spec(ns, &name).await;

    if has_finalizer(cluster) {
        let api: Api<MongoCluster> = Api::namespaced(ctx.client.clone(), ns);
        let remaining: Vec<String> = cluster
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        let patch = if remaining.is_empty() {
            serde_json::json!({ "metadata": { "finalizers": null } })
        } else {
            serde_json::json!({ "metadata": { "finalizers": remaining } })
        };

        match api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!("Removed finalizer from {}", name),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("{} already gone", name);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Action::await_change())
}
