//! GPU Inventory Controller
//!
//! Keeps one `GpuDevice` per discovered GPU and one `GpuNodeInventory` per
//! GPU node in sync with node labels, Node Feature Discovery data and,
//! optionally, per-node detection agents.

mod approval;
mod backoff;
mod config;
mod controller;
mod error;
mod events;
mod reconcile_helpers;
mod reconciler;
mod store;
#[cfg(test)]
mod test_utils;
mod watcher;

use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ControllerConfig;
use crate::error::ControllerError;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| ControllerError::InvalidConfig("a rustls crypto provider is already installed".to_string()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting GPU Inventory Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Controller name: {}", config.controller_name);
    info!(
        "  NodeFeature namespace: {}",
        config.node_feature_namespace.as_deref().unwrap_or("all namespaces")
    );
    match &config.policy_config {
        Some(policy) => info!("  Policy ConfigMap: {}/{}", policy.namespace, policy.name),
        None => info!("  Policy ConfigMap: none"),
    }
    info!("  Resync interval: {}s", config.resync_interval.as_secs());
    info!("  Concurrency: {}", config.concurrency);
    info!(
        "  Error backoff: {}s to {}s",
        config.error_backoff_min.as_secs(),
        config.error_backoff_max.as_secs()
    );

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
