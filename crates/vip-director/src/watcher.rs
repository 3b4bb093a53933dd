//! Observed cluster state.
//!
//! [`ClusterWatcher`] is the surface the director reads on every tick: the
//! current node inventory and the declared cluster configuration. Reads are
//! snapshots; writers replace whole values. Eventual consistency is fine
//! here - a stale read is reconciled again on the next tick.
//!
//! [`run_sync`] is the default populator: it polls the Kubernetes API for
//! nodes and for a ConfigMap key holding the JSON cluster config. The
//! director itself never talks to the API server.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ListParams;
use kube::{Api, Client};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{ClusterConfig, Node};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Failed to parse cluster config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("ConfigMap {namespace}/{name} has no key {key}")]
    MissingKey {
        namespace: String,
        name: String,
        key: String,
    },
}

/// Shared observed state. Cheap to clone snapshots out of; writers swap
/// whole values in.
///
/// # Panics
///
/// Accessors panic if a lock is poisoned (a writer panicked mid-update).
#[derive(Debug, Default)]
pub struct ClusterWatcher {
    nodes: RwLock<Option<Arc<Vec<Arc<Node>>>>>,
    config: RwLock<Option<Arc<ClusterConfig>>>,
}

impl ClusterWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current node inventory. `None` until the first sync.
    pub fn nodes(&self) -> Option<Arc<Vec<Arc<Node>>>> {
        self.nodes.read().expect("watcher nodes lock poisoned").clone()
    }

    /// Snapshot of the declared cluster config. `None` until the first sync.
    pub fn cluster_config(&self) -> Option<Arc<ClusterConfig>> {
        self.config
            .read()
            .expect("watcher config lock poisoned")
            .clone()
    }

    /// Whether both the config and the node inventory have been observed.
    pub fn is_synced(&self) -> bool {
        self.cluster_config().is_some() && self.nodes().is_some()
    }

    pub fn set_nodes(&self, nodes: Vec<Node>) {
        let nodes = Arc::new(nodes.into_iter().map(Arc::new).collect::<Vec<_>>());
        *self.nodes.write().expect("watcher nodes lock poisoned") = Some(nodes);
    }

    pub fn set_cluster_config(&self, config: ClusterConfig) {
        *self.config.write().expect("watcher config lock poisoned") = Some(Arc::new(config));
    }
}

/// Where the cluster config lives and how often to refresh observed state.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub configmap_namespace: String,
    pub configmap_name: String,
    pub configmap_key: String,
    pub poll_interval: Duration,
}

/// Poll nodes and the config ConfigMap until cancelled.
///
/// Individual cycle failures are logged and retried on the next tick; the
/// loop only exits on cancellation.
pub async fn run_sync(
    client: Client,
    watcher: Arc<ClusterWatcher>,
    settings: SyncSettings,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(settings.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        configmap = %settings.configmap_name,
        namespace = %settings.configmap_namespace,
        interval_secs = settings.poll_interval.as_secs(),
        "Starting watcher sync loop"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => {
                debug!("Watcher sync loop cancelled");
                return;
            }
        }

        if let Err(e) = sync_cycle(&client, &watcher, &settings).await {
            warn!(error = %e, "Watcher sync cycle failed");
        }
    }
}

async fn sync_cycle(
    client: &Client,
    watcher: &ClusterWatcher,
    settings: &SyncSettings,
) -> Result<(), SyncError> {
    let node_api: Api<Node> = Api::all(client.clone());
    let nodes = node_api.list(&ListParams::default()).await?;
    let count = nodes.items.len();
    watcher.set_nodes(nodes.items);

    let cm_api: Api<ConfigMap> = Api::namespaced(client.clone(), &settings.configmap_namespace);
    let cm = cm_api.get(&settings.configmap_name).await?;
    let raw = cm
        .data
        .as_ref()
        .and_then(|d| d.get(&settings.configmap_key))
        .ok_or_else(|| SyncError::MissingKey {
            namespace: settings.configmap_namespace.clone(),
            name: settings.configmap_name.clone(),
            key: settings.configmap_key.clone(),
        })?;

    let config: ClusterConfig = serde_json::from_str(raw)?;
    debug!(
        nodes = count,
        vips = config.config.len(),
        "Observed state refreshed"
    );
    watcher.set_cluster_config(config);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_node(name: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node
    }

    #[test]
    fn starts_unsynced() {
        let watcher = ClusterWatcher::new();
        assert!(watcher.nodes().is_none());
        assert!(watcher.cluster_config().is_none());
        assert!(!watcher.is_synced());
    }

    #[test]
    fn synced_after_both_sides_observed() {
        let watcher = ClusterWatcher::new();
        watcher.set_nodes(vec![named_node("a")]);
        assert!(!watcher.is_synced());

        watcher.set_cluster_config(ClusterConfig::default());
        assert!(watcher.is_synced());
    }

    #[test]
    fn snapshots_are_stable_across_updates() {
        let watcher = ClusterWatcher::new();
        watcher.set_nodes(vec![named_node("a")]);

        let before = watcher.nodes().unwrap();
        watcher.set_nodes(vec![named_node("b"), named_node("c")]);

        // The earlier snapshot still sees the old inventory.
        assert_eq!(before.len(), 1);
        assert_eq!(watcher.nodes().unwrap().len(), 2);
    }
}
