//! Main controller implementation.
//!
//! Wires the Kubernetes client, store, event sink, optional detection client
//! and the node watcher together. The approval policy is compiled before
//! anything touches the cluster, so a bad selector stops the process at
//! startup.

use std::sync::Arc;

use detection_client::DetectionClient;
use gpu_discovery::{SnapshotBuilder, StaticCatalog};
use kube::Client;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::KubeEventSink;
use crate::reconciler::{ErrorBackoff, Reconciler};
use crate::store::KubeStore;
use crate::watcher::Watcher;

/// Main controller for GPU inventory management.
#[derive(Debug)]
pub struct Controller {
    node_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its watcher.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing GPU Inventory Controller");

        let static_policy = config.static_policy().map_err(|e| {
            error!("Refusing to start with an invalid device approval policy: {}", e);
            e
        })?;
        info!(
            "Device approval mode: {}, managed node label: {} (default {})",
            static_policy.approval.mode(),
            static_policy.managed_nodes.effective_label_key(),
            if static_policy.managed_nodes.enabled_by_default { "managed" } else { "unmanaged" }
        );

        let kube_client = Client::try_default().await?;

        let store = KubeStore::new(kube_client.clone(), config.node_feature_namespace.as_deref());
        let events = KubeEventSink::new(kube_client.clone(), &config.controller_name);
        let builder = SnapshotBuilder::new(Arc::new(StaticCatalog::new()));

        let mut reconciler = Reconciler::new(store, events, builder, static_policy)
            .with_policy_config(config.policy_config.clone())
            .with_resync_interval(config.resync_interval)
            .with_error_backoff(ErrorBackoff {
                min: config.error_backoff_min,
                max: config.error_backoff_max,
            });
        match config.detection_port {
            Some(port) => {
                let detection = DetectionClient::new(port, config.detection_timeout)
                    .map_err(|e| ControllerError::InvalidConfig(format!("detection client: {e}")))?;
                info!("GPU detection enabled on port {}", port);
                reconciler = reconciler.with_detection(detection);
            }
            None => info!("GPU detection disabled (DETECTION_PORT not set)"),
        }
        let reconciler = Arc::new(reconciler);

        // Nodes deleted while we were down no longer produce watch events.
        info!("Performing startup sweep of existing GPU records...");
        match reconciler.startup_sweep().await {
            Ok(nodes) => info!("Startup sweep complete: {} node(s) visited", nodes),
            Err(e) => warn!("Startup sweep failed (will continue): {}", e),
        }

        let watcher = Watcher::new(
            reconciler,
            kube_client,
            config.node_feature_namespace.clone(),
            config.concurrency,
        );
        let node_watcher = tokio::spawn(async move { watcher.watch_nodes().await });

        Ok(Self { node_watcher })
    }

    /// Runs the controller until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("GPU Inventory Controller running");
        self.node_watcher
            .await
            .map_err(|e| ControllerError::Watch(format!("Node watcher panicked: {e}")))?
    }
}
