//! Kubernetes resource watchers.
//!
//! Nodes are the reconcile key. Device and inventory records are owned by
//! their Node, so a change to either wakes the node up again; NodeFeature
//! objects are mapped to their node by name or by the NFD node-name label.
//! `kube_runtime::Controller` guarantees at most one in-flight reconcile per
//! node and bounds the total with the configured concurrency.

use std::sync::Arc;
use std::time::Duration;

use crds::{GpuDevice, GpuNodeInventory, NFD_NODE_NAME_LABEL, NodeFeature};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config as RuntimeConfig};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher};
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::reconciler::{Reconciler, Requeue};

/// Delay used for an immediate requeue, so a hot conflict does not spin
const IMMEDIATE_REQUEUE: Duration = Duration::from_secs(1);

/// Translates a reconcile directive into a runtime action.
pub fn requeue_action(requeue: Requeue) -> Action {
    match requeue {
        Requeue::Immediate => Action::requeue(IMMEDIATE_REQUEUE),
        Requeue::After(delay) => Action::requeue(delay),
        Requeue::Never => Action::await_change(),
    }
}

/// Node a NodeFeature object describes.
pub fn node_for_feature(feature: &NodeFeature) -> Option<ObjectRef<Node>> {
    let node_name = feature
        .labels()
        .get(NFD_NODE_NAME_LABEL)
        .cloned()
        .unwrap_or_else(|| feature.name_any());
    if node_name.is_empty() {
        None
    } else {
        Some(ObjectRef::new(&node_name))
    }
}

async fn reconcile(node: Arc<Node>, ctx: Arc<Reconciler>) -> Result<Action, ControllerError> {
    let name = node.name_any();
    debug!("Reconciling node {}", name);
    let outcome = ctx.reconcile_node(&name).await?;
    ctx.reset_error(&name);
    Ok(requeue_action(outcome.requeue))
}

fn error_policy(node: Arc<Node>, error: &ControllerError, ctx: Arc<Reconciler>) -> Action {
    let name = node.name_any();
    ctx.increment_error(&name);
    let (backoff_seconds, error_count) = ctx.get_backoff_for_resource(&name);
    error!(
        "Reconciliation error for node {} (error #{}): {}, retrying in {}s",
        name, error_count, error, backoff_seconds
    );
    Action::requeue(Duration::from_secs(backoff_seconds))
}

/// Watches Nodes and everything that feeds into their inventory.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
    node_feature_namespace: Option<String>,
    concurrency: u16,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("node_feature_namespace", &self.node_feature_namespace)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        client: Client,
        node_feature_namespace: Option<String>,
        concurrency: u16,
    ) -> Self {
        Self {
            reconciler,
            client,
            node_feature_namespace,
            concurrency,
        }
    }

    /// Runs the node controller until its stream ends.
    pub async fn watch_nodes(&self) -> Result<(), ControllerError> {
        info!("Starting Node watcher (concurrency {})", self.concurrency);

        let nodes: Api<Node> = Api::all(self.client.clone());
        let devices: Api<GpuDevice> = Api::all(self.client.clone());
        let inventories: Api<GpuNodeInventory> = Api::all(self.client.clone());
        let node_features: Api<NodeFeature> = match &self.node_feature_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        // Debounce batches the burst of owned-object events our own writes cause.
        let runtime_config = RuntimeConfig::default()
            .debounce(Duration::from_secs(5))
            .concurrency(self.concurrency);

        Controller::new(nodes, watcher::Config::default())
            .owns(devices, watcher::Config::default())
            .owns(inventories, watcher::Config::default())
            .watches(node_features, watcher::Config::default(), |feature| node_for_feature(&feature))
            .with_config(runtime_config)
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::clone(&self.reconciler))
            .for_each(|result| async move {
                match result {
                    Ok((node, _)) => debug!("Reconciled {}", node.name),
                    Err(e) => warn!("Node controller error: {}", e),
                }
            })
            .await;

        info!("Node watcher stopped");
        Ok(())
    }
}
