//! `InventoryStore` backed by the Kubernetes API.

use std::collections::BTreeMap;

use crds::{DEVICE_NODE_LABEL, GpuDevice, GpuNodeInventory, NFD_NODE_NAME_LABEL, NodeFeature};
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use super::{InventoryStore, MetadataPatch, StoreError};

/// Kubernetes-backed store
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    nodes: Api<Node>,
    node_features: Api<NodeFeature>,
    devices: Api<GpuDevice>,
    inventories: Api<GpuNodeInventory>,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Creates a store. NodeFeature objects are read from
    /// `node_feature_namespace`, or from all namespaces when unset.
    pub fn new(client: Client, node_feature_namespace: Option<&str>) -> Self {
        let node_features = match node_feature_namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        Self {
            nodes: Api::all(client.clone()),
            node_features,
            devices: Api::all(client.clone()),
            inventories: Api::all(client.clone()),
            client,
        }
    }

    fn metadata_json(patch: &MetadataPatch) -> serde_json::Value {
        json!({
            "labels": patch.labels,
            "ownerReferences": patch.owner_references,
            "resourceVersion": patch.resource_version,
        })
    }
}

#[async_trait::async_trait]
impl InventoryStore for KubeStore {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, StoreError> {
        self.nodes
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("Node/{name}")))
    }

    async fn node_feature_candidates(&self, node_name: &str) -> Result<Vec<NodeFeature>, StoreError> {
        let what = format!("NodeFeature/{node_name}");
        let by_name = self
            .node_features
            .list(&ListParams::default().fields(&format!("metadata.name={node_name}")))
            .await
            .map_err(|e| StoreError::from_kube(e, &what))?;
        let by_label = self
            .node_features
            .list(&ListParams::default().labels(&format!("{NFD_NODE_NAME_LABEL}={node_name}")))
            .await
            .map_err(|e| StoreError::from_kube(e, &what))?;

        let mut candidates: Vec<NodeFeature> = by_name.items;
        for feature in by_label.items {
            let duplicate = candidates
                .iter()
                .any(|c| c.name_any() == feature.name_any() && c.namespace() == feature.namespace());
            if !duplicate {
                candidates.push(feature);
            }
        }
        debug!("Found {} NodeFeature candidate(s) for node {}", candidates.len(), node_name);
        Ok(candidates)
    }

    async fn list_devices_for_node(&self, node_name: &str) -> Result<Vec<GpuDevice>, StoreError> {
        let params = ListParams::default().labels(&format!("{DEVICE_NODE_LABEL}={node_name}"));
        self.devices
            .list(&params)
            .await
            .map(|list| list.items)
            .map_err(|e| StoreError::from_kube(e, &format!("GpuDevice(node={node_name})")))
    }

    async fn list_devices(&self) -> Result<Vec<GpuDevice>, StoreError> {
        self.devices
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| StoreError::from_kube(e, "GpuDevice"))
    }

    async fn get_device(&self, name: &str) -> Result<Option<GpuDevice>, StoreError> {
        self.devices
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("GpuDevice/{name}")))
    }

    async fn create_device(&self, device: &GpuDevice) -> Result<GpuDevice, StoreError> {
        self.devices
            .create(&PostParams::default(), device)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("GpuDevice/{}", device.name_any())))
    }

    async fn patch_device_metadata(&self, name: &str, patch: &MetadataPatch) -> Result<GpuDevice, StoreError> {
        let body = json!({ "metadata": Self::metadata_json(patch) });
        self.devices
            .patch(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("GpuDevice/{name}")))
    }

    async fn update_device_status(&self, device: &GpuDevice) -> Result<GpuDevice, StoreError> {
        let name = device.name_any();
        let body = json!({
            "metadata": { "resourceVersion": device.resource_version() },
            "status": device.status,
        });
        self.devices
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("GpuDevice/{name}")))
    }

    async fn delete_device(&self, name: &str) -> Result<(), StoreError> {
        self.devices
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, &format!("GpuDevice/{name}")))
    }

    async fn get_inventory(&self, name: &str) -> Result<Option<GpuNodeInventory>, StoreError> {
        self.inventories
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("GpuNodeInventory/{name}")))
    }

    async fn list_inventories(&self) -> Result<Vec<GpuNodeInventory>, StoreError> {
        self.inventories
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| StoreError::from_kube(e, "GpuNodeInventory"))
    }

    async fn create_inventory(&self, inventory: &GpuNodeInventory) -> Result<GpuNodeInventory, StoreError> {
        self.inventories
            .create(&PostParams::default(), inventory)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("GpuNodeInventory/{}", inventory.name_any())))
    }

    async fn patch_inventory_spec(
        &self,
        name: &str,
        node_name: &str,
        patch: &MetadataPatch,
    ) -> Result<GpuNodeInventory, StoreError> {
        let body = json!({
            "metadata": Self::metadata_json(patch),
            "spec": { "nodeName": node_name },
        });
        self.inventories
            .patch(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("GpuNodeInventory/{name}")))
    }

    async fn update_inventory_status(&self, inventory: &GpuNodeInventory) -> Result<GpuNodeInventory, StoreError> {
        let name = inventory.name_any();
        let body = json!({
            "metadata": { "resourceVersion": inventory.resource_version() },
            "status": inventory.status,
        });
        self.inventories
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("GpuNodeInventory/{name}")))
    }

    async fn delete_inventory(&self, name: &str) -> Result<(), StoreError> {
        self.inventories
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, &format!("GpuNodeInventory/{name}")))
    }

    async fn get_policy_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        config_maps
            .get_opt(name)
            .await
            .map(|cm| cm.map(|cm| cm.data.unwrap_or_default()))
            .map_err(|e| StoreError::from_kube(e, &format!("ConfigMap/{namespace}/{name}")))
    }
}
