//! Cluster store abstraction.
//!
//! Every read and write the reconcilers perform goes through
//! [`InventoryStore`], so the reconciliation logic can be exercised against
//! an in-memory store in tests. Writes carry the resource version the caller
//! last observed; a stale version surfaces as [`StoreError::Conflict`].

pub mod cluster;
#[cfg(test)]
pub mod mock;

use std::collections::BTreeMap;

use crds::{GpuDevice, GpuNodeInventory, NodeFeature};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use thiserror::Error;

pub use cluster::KubeStore;

/// Store errors. `Conflict` and `NotFound` are expected outcomes that the
/// reconcilers translate into retries or successes.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object changed since it was read, or already exists
    #[error("conflict on {0}")]
    Conflict(String),

    /// Object does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Any other API failure
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl StoreError {
    /// Maps an API error to a store error for `what` (e.g. `GpuDevice/foo`).
    pub fn from_kube(error: kube::Error, what: &str) -> Self {
        match &error {
            kube::Error::Api(response) if response.code == 409 => StoreError::Conflict(what.to_string()),
            kube::Error::Api(response) if response.code == 404 => StoreError::NotFound(what.to_string()),
            _ => StoreError::Kube(error),
        }
    }
}

/// Metadata a controller-owned record must carry
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataPatch {
    /// Labels to set (merged into the existing labels)
    pub labels: BTreeMap<String, String>,
    /// Full replacement owner reference list
    pub owner_references: Vec<OwnerReference>,
    /// Resource version the patch is conditional on
    pub resource_version: Option<String>,
}

/// Read/write access to everything the reconcilers touch
#[async_trait::async_trait]
pub trait InventoryStore: Send + Sync {
    /// Get a node; `None` when it does not exist.
    async fn get_node(&self, name: &str) -> Result<Option<Node>, StoreError>;

    /// NodeFeature objects that may describe `node_name`: the one named after
    /// the node plus those labelled with it.
    async fn node_feature_candidates(&self, node_name: &str) -> Result<Vec<NodeFeature>, StoreError>;

    /// Device records labelled with `node_name`.
    async fn list_devices_for_node(&self, node_name: &str) -> Result<Vec<GpuDevice>, StoreError>;

    /// All device records.
    async fn list_devices(&self) -> Result<Vec<GpuDevice>, StoreError>;

    async fn get_device(&self, name: &str) -> Result<Option<GpuDevice>, StoreError>;

    /// Create a device record (status is ignored by the API server).
    async fn create_device(&self, device: &GpuDevice) -> Result<GpuDevice, StoreError>;

    async fn patch_device_metadata(&self, name: &str, patch: &MetadataPatch) -> Result<GpuDevice, StoreError>;

    /// Write `device.status`, conditional on `device`'s resource version.
    async fn update_device_status(&self, device: &GpuDevice) -> Result<GpuDevice, StoreError>;

    async fn delete_device(&self, name: &str) -> Result<(), StoreError>;

    async fn get_inventory(&self, name: &str) -> Result<Option<GpuNodeInventory>, StoreError>;

    async fn list_inventories(&self) -> Result<Vec<GpuNodeInventory>, StoreError>;

    async fn create_inventory(&self, inventory: &GpuNodeInventory) -> Result<GpuNodeInventory, StoreError>;

    /// Set `spec.nodeName` and the metadata of an inventory record.
    async fn patch_inventory_spec(
        &self,
        name: &str,
        node_name: &str,
        patch: &MetadataPatch,
    ) -> Result<GpuNodeInventory, StoreError>;

    /// Write `inventory.status`, conditional on its resource version.
    async fn update_inventory_status(&self, inventory: &GpuNodeInventory) -> Result<GpuNodeInventory, StoreError>;

    async fn delete_inventory(&self, name: &str) -> Result<(), StoreError>;

    /// Data of the policy ConfigMap; `None` when it does not exist.
    async fn get_policy_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError>;
}
