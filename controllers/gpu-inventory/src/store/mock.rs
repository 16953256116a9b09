//! In-memory `InventoryStore` for unit tests.
//!
//! Mimics the API server behaviour the reconcilers depend on: resource
//! versions bump on every write, stale versions are rejected with a conflict,
//! `create` drops the status block, and deleting a missing object reports
//! `NotFound`. Every write is logged so tests can assert idempotence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crds::{DEVICE_NODE_LABEL, GpuDevice, GpuNodeInventory, NFD_NODE_NAME_LABEL, NodeFeature};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use super::{InventoryStore, MetadataPatch, StoreError};

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    node_features: Vec<NodeFeature>,
    devices: BTreeMap<String, GpuDevice>,
    inventories: BTreeMap<String, GpuNodeInventory>,
    config_maps: BTreeMap<(String, String), BTreeMap<String, String>>,
    config_unavailable: bool,
    next_version: u64,
    writes: Vec<String>,
    conflicts: HashMap<String, usize>,
    vanishing: HashSet<String>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Consumes one injected conflict for `name`, if any.
    fn take_conflict(&mut self, name: &str) -> bool {
        match self.conflicts.get_mut(name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Mock store for testing
#[derive(Debug, Clone, Default)]
pub struct MockInventoryStore {
    state: Arc<Mutex<State>>,
}

impl MockInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a node
    pub fn add_node(&self, node: Node) {
        let mut state = self.state();
        state.nodes.insert(node.name_any(), node);
    }

    pub fn remove_node(&self, name: &str) {
        self.state().nodes.remove(name);
    }

    /// Add or replace a NodeFeature object
    pub fn add_node_feature(&self, feature: NodeFeature) {
        let mut state = self.state();
        let version = state.bump();
        let mut feature = feature;
        if feature.metadata.resource_version.is_none() {
            feature.metadata.resource_version = Some(version);
        }
        state.node_features.push(feature);
    }

    /// Seeds a device record as if another round had created it.
    pub fn insert_device(&self, device: GpuDevice) {
        let mut state = self.state();
        let version = state.bump();
        let mut device = device;
        device.metadata.resource_version = Some(version);
        state.devices.insert(device.name_any(), device);
    }

    /// Seeds an inventory record.
    pub fn insert_inventory(&self, inventory: GpuNodeInventory) {
        let mut state = self.state();
        let version = state.bump();
        let mut inventory = inventory;
        inventory.metadata.resource_version = Some(version);
        state.inventories.insert(inventory.name_any(), inventory);
    }

    /// Publish policy ConfigMap data under `namespace/name`
    pub fn set_policy_config(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        self.state()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), data);
    }

    /// Make ConfigMap reads fail the way an unreachable API server does.
    pub fn make_policy_config_unavailable(&self) {
        self.state().config_unavailable = true;
    }

    /// Make the next `times` writes to the object named `name` fail with a conflict.
    pub fn inject_conflict(&self, name: &str, times: usize) {
        self.state().conflicts.insert(name.to_string(), times);
    }

    /// Make the next delete of device `name` find it already gone, as if
    /// another actor removed it after it was listed.
    pub fn inject_not_found(&self, name: &str) {
        self.state().vanishing.insert(name.to_string());
    }

    pub fn device(&self, name: &str) -> Option<GpuDevice> {
        self.state().devices.get(name).cloned()
    }

    /// Names of all stored device records
    pub fn device_names(&self) -> Vec<String> {
        self.state().devices.keys().cloned().collect()
    }

    pub fn inventory(&self, name: &str) -> Option<GpuNodeInventory> {
        self.state().inventories.get(name).cloned()
    }

    /// Writes performed so far, as `"<verb> <kind>/<name>"`.
    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    /// Forget the write log
    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }
}

fn apply_metadata(meta: &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta, patch: &MetadataPatch) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    for (key, value) in &patch.labels {
        labels.insert(key.clone(), value.clone());
    }
    meta.owner_references = Some(patch.owner_references.clone());
}

#[async_trait::async_trait]
impl InventoryStore for MockInventoryStore {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, StoreError> {
        Ok(self.state().nodes.get(name).cloned())
    }

    async fn node_feature_candidates(&self, node_name: &str) -> Result<Vec<NodeFeature>, StoreError> {
        Ok(self
            .state()
            .node_features
            .iter()
            .filter(|f| {
                f.name_any() == node_name
                    || f.labels().get(NFD_NODE_NAME_LABEL).map(String::as_str) == Some(node_name)
            })
            .cloned()
            .collect())
    }

    async fn list_devices_for_node(&self, node_name: &str) -> Result<Vec<GpuDevice>, StoreError> {
        Ok(self
            .state()
            .devices
            .values()
            .filter(|d| d.labels().get(DEVICE_NODE_LABEL).map(String::as_str) == Some(node_name))
            .cloned()
            .collect())
    }

    async fn list_devices(&self) -> Result<Vec<GpuDevice>, StoreError> {
        Ok(self.state().devices.values().cloned().collect())
    }

    async fn get_device(&self, name: &str) -> Result<Option<GpuDevice>, StoreError> {
        Ok(self.state().devices.get(name).cloned())
    }

    async fn create_device(&self, device: &GpuDevice) -> Result<GpuDevice, StoreError> {
        let mut state = self.state();
        let name = device.name_any();
        if state.take_conflict(&name) || state.devices.contains_key(&name) {
            return Err(StoreError::Conflict(format!("GpuDevice/{name}")));
        }
        let mut created = device.clone();
        created.status = None;
        created.metadata.resource_version = Some(state.bump());
        created.metadata.uid = Some(format!("{name}-uid"));
        created.metadata.generation = Some(1);
        state.devices.insert(name.clone(), created.clone());
        state.writes.push(format!("create GpuDevice/{name}"));
        Ok(created)
    }

    async fn patch_device_metadata(&self, name: &str, patch: &MetadataPatch) -> Result<GpuDevice, StoreError> {
        let mut state = self.state();
        if state.take_conflict(name) {
            return Err(StoreError::Conflict(format!("GpuDevice/{name}")));
        }
        let version = state.bump();
        let device = state
            .devices
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("GpuDevice/{name}")))?;
        if patch.resource_version.is_some() && patch.resource_version != device.metadata.resource_version {
            return Err(StoreError::Conflict(format!("GpuDevice/{name}")));
        }
        apply_metadata(&mut device.metadata, patch);
        device.metadata.resource_version = Some(version);
        let patched = device.clone();
        state.writes.push(format!("patch GpuDevice/{name}"));
        Ok(patched)
    }

    async fn update_device_status(&self, device: &GpuDevice) -> Result<GpuDevice, StoreError> {
        let mut state = self.state();
        let name = device.name_any();
        if state.take_conflict(&name) {
            return Err(StoreError::Conflict(format!("GpuDevice/{name}")));
        }
        let version = state.bump();
        let stored = state
            .devices
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(format!("GpuDevice/{name}")))?;
        if device.metadata.resource_version != stored.metadata.resource_version {
            return Err(StoreError::Conflict(format!("GpuDevice/{name}")));
        }
        stored.status = device.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.writes.push(format!("status GpuDevice/{name}"));
        Ok(updated)
    }

    async fn delete_device(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.vanishing.remove(name) {
            state.devices.remove(name);
            return Err(StoreError::NotFound(format!("GpuDevice/{name}")));
        }
        if state.devices.remove(name).is_none() {
            return Err(StoreError::NotFound(format!("GpuDevice/{name}")));
        }
        state.writes.push(format!("delete GpuDevice/{name}"));
        Ok(())
    }

    async fn get_inventory(&self, name: &str) -> Result<Option<GpuNodeInventory>, StoreError> {
        Ok(self.state().inventories.get(name).cloned())
    }

    async fn list_inventories(&self) -> Result<Vec<GpuNodeInventory>, StoreError> {
        Ok(self.state().inventories.values().cloned().collect())
    }

    async fn create_inventory(&self, inventory: &GpuNodeInventory) -> Result<GpuNodeInventory, StoreError> {
        let mut state = self.state();
        let name = inventory.name_any();
        if state.take_conflict(&name) || state.inventories.contains_key(&name) {
            return Err(StoreError::Conflict(format!("GpuNodeInventory/{name}")));
        }
        let mut created = inventory.clone();
        created.status = None;
        created.metadata.resource_version = Some(state.bump());
        created.metadata.uid = Some(format!("{name}-uid"));
        created.metadata.generation = Some(1);
        state.inventories.insert(name.clone(), created.clone());
        state.writes.push(format!("create GpuNodeInventory/{name}"));
        Ok(created)
    }

    async fn patch_inventory_spec(
        &self,
        name: &str,
        node_name: &str,
        patch: &MetadataPatch,
    ) -> Result<GpuNodeInventory, StoreError> {
        let mut state = self.state();
        if state.take_conflict(name) {
            return Err(StoreError::Conflict(format!("GpuNodeInventory/{name}")));
        }
        let version = state.bump();
        let inventory = state
            .inventories
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("GpuNodeInventory/{name}")))?;
        if patch.resource_version.is_some() && patch.resource_version != inventory.metadata.resource_version {
            return Err(StoreError::Conflict(format!("GpuNodeInventory/{name}")));
        }
        apply_metadata(&mut inventory.metadata, patch);
        if inventory.spec.node_name != node_name {
            inventory.spec.node_name = node_name.to_string();
            inventory.metadata.generation = Some(inventory.metadata.generation.unwrap_or(0) + 1);
        }
        inventory.metadata.resource_version = Some(version);
        let patched = inventory.clone();
        state.writes.push(format!("patch GpuNodeInventory/{name}"));
        Ok(patched)
    }

    async fn update_inventory_status(&self, inventory: &GpuNodeInventory) -> Result<GpuNodeInventory, StoreError> {
        let mut state = self.state();
        let name = inventory.name_any();
        if state.take_conflict(&name) {
            return Err(StoreError::Conflict(format!("GpuNodeInventory/{name}")));
        }
        let version = state.bump();
        let stored = state
            .inventories
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(format!("GpuNodeInventory/{name}")))?;
        if inventory.metadata.resource_version != stored.metadata.resource_version {
            return Err(StoreError::Conflict(format!("GpuNodeInventory/{name}")));
        }
        stored.status = inventory.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.writes.push(format!("status GpuNodeInventory/{name}"));
        Ok(updated)
    }

    async fn delete_inventory(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.inventories.remove(name).is_none() {
            return Err(StoreError::NotFound(format!("GpuNodeInventory/{name}")));
        }
        state.writes.push(format!("delete GpuNodeInventory/{name}"));
        Ok(())
    }

    async fn get_policy_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let state = self.state();
        if state.config_unavailable {
            let refused = std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("ConfigMap/{namespace}/{name}: connection refused"),
            );
            return Err(StoreError::Kube(kube::Error::Service(Box::new(refused))));
        }
        Ok(state
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
