//! Per-node orchestration.
//!
//! One call handles one node end to end: resolve policy and discovery data,
//! build the snapshot, reconcile every device, delete orphans, reconcile the
//! inventory and fold all retry requests into a single directive.

use std::collections::{BTreeSet, HashSet};

use crds::{DEVICE_NODE_LABEL, GpuDevice, NFD_NODE_NAME_LABEL, NodeFeature};
use detection_client::NodeDetection;
use gpu_discovery::NodeSnapshot;
use k8s_openapi::api::core::v1::Node;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use super::device::DeviceContext;
use super::{Reconciler, Requeue};
use crate::approval::DeviceApprovalPolicy;
use crate::error::ControllerError;
use crate::events::{InventoryEvent, REASON_DETECTION_UNAVAILABLE, REASON_DEVICE_REMOVED};
use crate::reconcile_helpers::node_owner_reference;
use crate::store::StoreError;

/// Result of one node round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutcome {
    /// When the node should be examined again
    pub requeue: Requeue,
    /// Devices in the snapshot
    pub devices: usize,
    /// Device records deleted
    pub removed: usize,
}

/// Picks the NodeFeature describing `node_name`: the one named after the
/// node, else the labelled candidate with the highest resource version.
pub fn select_node_feature<'a>(node_name: &str, candidates: &'a [NodeFeature]) -> Option<&'a NodeFeature> {
    if let Some(exact) = candidates.iter().find(|f| f.name_any() == node_name) {
        return Some(exact);
    }
    candidates
        .iter()
        .filter(|f| f.labels().get(NFD_NODE_NAME_LABEL).map(String::as_str) == Some(node_name))
        .max_by(|a, b| {
            let (a, b) = (a.resource_version().unwrap_or_default(), b.resource_version().unwrap_or_default());
            match (a.parse::<u64>(), b.parse::<u64>()) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(&b),
            }
        })
}

/// Existing records whose name is not among the desired ones.
pub fn find_orphans<'a>(existing: &'a [GpuDevice], desired: &HashSet<String>) -> Vec<&'a GpuDevice> {
    existing
        .iter()
        .filter(|record| !desired.contains(&record.name_any()))
        .collect()
}

/// Address the detection agent of `node` listens on: its InternalIP, else
/// the first reported address.
fn node_address(node: &Node) -> String {
    let addresses = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_deref())
        .unwrap_or_default();
    addresses
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .or_else(|| addresses.first())
        .map(|a| a.address.clone())
        .unwrap_or_default()
}

impl Reconciler {
    /// Reconciles everything the controller owns for one node.
    ///
    /// A missing node is torn down, which is not an error.
    pub async fn reconcile_node(&self, node_name: &str) -> Result<NodeOutcome, ControllerError> {
        let Some(node) = self.store.get_node(node_name).await? else {
            let removed = self.teardown_node(node_name).await?;
            return Ok(NodeOutcome {
                requeue: Requeue::Never,
                devices: 0,
                removed,
            });
        };

        let policy = self.effective_policy().await;
        let candidates = self.store.node_feature_candidates(node_name).await?;
        let feature = select_node_feature(node_name, &candidates);
        let snapshot = self
            .builder
            .build(node_name, node.labels(), feature, &policy.managed_nodes);
        debug!(
            "Node {}: {} device(s), managed={}, discovery source detected={}",
            node_name,
            snapshot.devices.len(),
            snapshot.managed,
            snapshot.feature_source_detected
        );

        let owner = node_owner_reference(&node)?;
        let existing = self.store.list_devices_for_node(node_name).await?;
        let detection = self.collect_detection(&node, &snapshot).await;

        let mut requests = Vec::new();
        let mut records = Vec::new();
        for device in &snapshot.devices {
            let device_labels = DeviceApprovalPolicy::device_labels(device);
            let ctx = DeviceContext {
                node_name,
                owner: &owner,
                device,
                managed: snapshot.managed,
                auto_attach: policy.approval.auto_attach(snapshot.managed, &device_labels),
                detection: detection
                    .as_ref()
                    .and_then(|d| d.find_device(&device.uuid, &device.index)),
            };
            let outcome = self.reconcile_device(&ctx).await?;
            requests.extend(outcome.requeue);
            records.extend(outcome.record);
        }

        let desired: HashSet<String> = snapshot
            .devices
            .iter()
            .map(|d| d.record_name(node_name))
            .collect();
        let mut removed = 0;
        for orphan in find_orphans(&existing, &desired) {
            if self.delete_device_record(orphan, node_name).await? {
                removed += 1;
            }
        }

        let label_key = policy.managed_nodes.effective_label_key().to_string();
        requests.extend(
            self.reconcile_inventory(&owner, &snapshot, &label_key, &records)
                .await?,
        );

        let requeue = Requeue::combine(&requests, !snapshot.devices.is_empty(), self.resync_interval);
        info!(
            "Reconciled node {}: {} device(s), {} removed, requeue {:?}",
            node_name,
            snapshot.devices.len(),
            removed,
            requeue
        );
        Ok(NodeOutcome {
            requeue,
            devices: snapshot.devices.len(),
            removed,
        })
    }

    /// Deletes every record of a node that no longer exists.
    ///
    /// Returns the number of device records deleted.
    pub async fn teardown_node(&self, node_name: &str) -> Result<usize, ControllerError> {
        let mut removed = 0;
        for record in self.store.list_devices_for_node(node_name).await? {
            if self.delete_device_record(&record, node_name).await? {
                removed += 1;
            }
        }
        match self.store.delete_inventory(node_name).await {
            Ok(()) => info!("Deleted GpuNodeInventory {} (node is gone)", node_name),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => {
                error!("Failed to delete GpuNodeInventory {}: {}", node_name, e);
                return Err(e.into());
            }
        }
        if removed > 0 {
            info!("Tore down node {}: {} device record(s) deleted", node_name, removed);
        }
        Ok(removed)
    }

    /// Reconciles every node that still has records, so records of nodes
    /// deleted while the controller was down are cleaned up.
    ///
    /// Returns the number of nodes visited. Per-node failures are logged.
    pub async fn startup_sweep(&self) -> Result<usize, ControllerError> {
        let mut nodes = BTreeSet::new();
        for inventory in self.store.list_inventories().await? {
            let name = if inventory.spec.node_name.is_empty() {
                inventory.name_any()
            } else {
                inventory.spec.node_name.clone()
            };
            nodes.insert(name);
        }
        for record in self.store.list_devices().await? {
            if let Some(node_name) = record.labels().get(DEVICE_NODE_LABEL) {
                nodes.insert(node_name.clone());
            }
        }

        info!("Startup sweep over {} node(s) with GPU records", nodes.len());
        for node_name in &nodes {
            if let Err(e) = self.reconcile_node(node_name).await {
                warn!("Startup sweep failed for node {}: {}", node_name, e);
            }
        }
        Ok(nodes.len())
    }

    /// Deletes one device record; already-gone records count as not deleted.
    async fn delete_device_record(&self, record: &GpuDevice, node_name: &str) -> Result<bool, ControllerError> {
        let name = record.name_any();
        match self.store.delete_device(&name).await {
            Ok(()) => {
                info!("Deleted GpuDevice {} from node {}", name, node_name);
                self.events
                    .publish(
                        &record.object_ref(&()),
                        InventoryEvent::normal(
                            REASON_DEVICE_REMOVED,
                            "Delete",
                            format!("GPU record {name} removed: device no longer present on node {node_name}"),
                        ),
                    )
                    .await;
                Ok(true)
            }
            Err(StoreError::NotFound(_)) => {
                debug!("GpuDevice {} already deleted", name);
                Ok(false)
            }
            Err(e) => {
                error!("Failed to delete GpuDevice {}: {}", name, e);
                Err(e.into())
            }
        }
    }

    /// Fetches live readings from the node's detection agent, if configured.
    ///
    /// Failures are logged and reported as a warning event on the node.
    async fn collect_detection(&self, node: &Node, snapshot: &NodeSnapshot) -> Option<NodeDetection> {
        let client = self.detection.as_ref()?;
        if snapshot.devices.is_empty() {
            return None;
        }
        let node_name = node.name_any();
        match client.fetch_detection(&node_name, &node_address(node)).await {
            Ok(detection) => Some(detection),
            Err(e) => {
                warn!("GPU detection unavailable for node {}: {}", node_name, e);
                self.events
                    .publish(
                        &node.object_ref(&()),
                        InventoryEvent::warning(
                            REASON_DETECTION_UNAVAILABLE,
                            "Reconcile",
                            format!("GPU detection agent unavailable: {e}"),
                        ),
                    )
                    .await;
                None
            }
        }
    }
}
