use std::collections::HashMap;
use std::sync::Arc;

use kube::Client;
use tokio::sync::RwLock;

use crate::backup::{RestoreController, StatusLedger, StorageAccess};
use crate::clock::{Clock, SystemClock};
use crate::config::OperatorConfig;
use crate::controller::backend::{DatabaseShell, MemberBackend};
use crate::controller::cluster_state::ClusterStateStore;
use crate::controller::normalize::ClusterSpec;
use crate::health::HealthState;
use crate::resources::members::KubeMemberBackend;
use crate::resources::mongo_shell::KubeMongoShell;

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Metrics sink, absent when the controller runs without a health server
    pub health_state: Option<Arc<HealthState>>,
    pub config: Arc<OperatorConfig>,
    /// Observed cluster states, published for the backup task
    pub state_store: ClusterStateStore,
    pub backend: Arc<dyn MemberBackend>,
    pub restorer: Arc<RestoreController>,
    pub ledger: StatusLedger,
    pub clock: Arc<dyn Clock>,
    /// Last accepted spec per cluster, keyed like the state store
    accepted_specs: Arc<RwLock<HashMap<String, ClusterSpec>>>,
}

impl Context {
    pub fn new(
        client: Client,
        health_state: Option<Arc<HealthState>>,
        config: Arc<OperatorConfig>,
        state_store: ClusterStateStore,
        storage: StorageAccess,
    ) -> Self {
        let shell: Arc<dyn DatabaseShell> = Arc::new(KubeMongoShell::new(client.clone()));
        let restorer = RestoreController::new(
            shell.clone(),
            storage,
            config.restore_timeout,
            config.restore_max_attempts,
        );

        Self {
            backend: Arc::new(KubeMemberBackend::new(client.clone(), shell)),
            restorer: Arc::new(restorer),
            ledger: StatusLedger::new(client.clone()),
            clock: Arc::new(SystemClock),
            accepted_specs: Arc::default(),
            client,
            health_state,
            config,
            state_store,
        }
    }

    /// Remember `spec` as the accepted spec and return the one it replaces
    pub async fn accept_spec(&self, spec: &ClusterSpec) -> Option<ClusterSpec> {
        self.accepted_specs.write().await.insert(
            ClusterStateStore::key(&spec.namespace, &spec.name),
            spec.clone(),
        )
    }

    pub async fn forget_spec(&self, namespace: &str, name: &str) {
        self.accepted_specs
            .write()
            .await
            .remove(&ClusterStateStore::key(namespace, name));
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        if let Some(health) = &self.health_state {
            health.metrics.record_reconcile(namespace, name, duration_secs);
        }
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        if let Some(health) = &self.health_state {
            health.metrics.record_error(namespace, name);
        }
    }
}
