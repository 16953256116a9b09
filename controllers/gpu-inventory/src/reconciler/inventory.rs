//! Node inventory reconciliation.
//!
//! The inventory record aggregates the device records of one node and
//! reports two conditions. It is created lazily on the first device and then
//! kept, even at zero devices, until the node itself goes away.

use std::collections::BTreeMap;

use chrono::Utc;
use crds::{
    CONDITION_INVENTORY_COMPLETE, CONDITION_MANAGED_DISABLED, ConditionStatus, GpuDevice, GpuDeviceSummary,
    GpuNodeInventory, GpuNodeInventorySpec, InventoryCondition,
};
use gpu_discovery::{DeviceSnapshot, NodeSnapshot};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info};

use super::{Reconciler, Requeue};
use crate::error::ControllerError;
use crate::events::InventoryEvent;
use crate::reconcile_helpers::{ConditionChange, metadata_patch, set_field, upsert_condition};
use crate::store::{MetadataPatch, StoreError};

/// Condition reasons
pub const REASON_MANAGED_DISABLED: &str = "ManagedDisabled";
pub const REASON_MANAGED_ENABLED: &str = "ManagedEnabled";
pub const REASON_INVENTORY_SYNCED: &str = "InventorySynced";
pub const REASON_DISCOVERY_PENDING: &str = "DiscoveryPending";
pub const REASON_NO_DEVICES: &str = "NoDevicesDiscovered";

/// Summary of one device, preferring what the record says and falling back
/// to the snapshot for anything the record left empty.
pub(crate) fn device_summary(node_name: &str, record: &GpuDevice, snapshot: Option<&DeviceSnapshot>) -> GpuDeviceSummary {
    let status = record.status.clone().unwrap_or_default();
    let hardware = &status.hardware;
    let pick = |recorded: &str, discovered: Option<&str>| -> String {
        if recorded.is_empty() {
            discovered.unwrap_or_default().to_string()
        } else {
            recorded.to_string()
        }
    };

    let index = pick(&hardware.index, snapshot.map(|s| s.index.as_str()));
    let inventory_id = if status.inventory_id.is_empty() {
        format!("{node_name}/{index}")
    } else {
        status.inventory_id.clone()
    };
    let memory_mib = match (hardware.memory_mib, snapshot) {
        (0, Some(s)) => s.memory_mib,
        (recorded, _) => recorded,
    };

    GpuDeviceSummary {
        inventory_id,
        device_name: record.name_any(),
        index,
        vendor: pick(&hardware.vendor, snapshot.map(|s| s.vendor.as_str())),
        device: pick(&hardware.device, snapshot.map(|s| s.device.as_str())),
        product: pick(&hardware.product, snapshot.map(|s| s.product.as_str())),
        uuid: pick(&hardware.uuid, snapshot.map(|s| s.uuid.as_str())),
        pci_address: pick(&hardware.pci_address, snapshot.map(|s| s.pci_address.as_str())),
        memory_mib,
        mig_capable: hardware.mig.capable || snapshot.is_some_and(|s| s.mig.capable),
        state: status.state,
        managed: status.managed,
        auto_attach: status.auto_attach,
    }
}

/// The two inventory conditions for a snapshot.
pub(crate) fn desired_conditions(
    snapshot: &NodeSnapshot,
    managed_label_key: &str,
    observed_generation: Option<i64>,
) -> [InventoryCondition; 2] {
    let label_value = snapshot.labels.get(managed_label_key);
    let (managed_reason, managed_message) = match (snapshot.managed, label_value) {
        (true, Some(value)) => (
            REASON_MANAGED_ENABLED,
            format!("GPU management is enabled (node label {managed_label_key}={value})"),
        ),
        (true, None) => (
            REASON_MANAGED_ENABLED,
            format!("GPU management is enabled by default (node label {managed_label_key} is absent)"),
        ),
        (false, Some(_)) => (
            REASON_MANAGED_DISABLED,
            format!("GPU management is disabled by node label {managed_label_key}=false"),
        ),
        (false, None) => (
            REASON_MANAGED_DISABLED,
            format!("GPU management is disabled by default (node label {managed_label_key} is absent)"),
        ),
    };

    let (complete, complete_reason, complete_message) = if !snapshot.feature_source_detected {
        (false, REASON_DISCOVERY_PENDING, "discovery source not yet observed".to_string())
    } else if snapshot.devices.is_empty() {
        (
            false,
            REASON_NO_DEVICES,
            "discovery source observed but no GPU devices were found".to_string(),
        )
    } else {
        (
            true,
            REASON_INVENTORY_SYNCED,
            "GPU inventory synced from the discovery source".to_string(),
        )
    };

    [
        InventoryCondition {
            type_: CONDITION_MANAGED_DISABLED.to_string(),
            status: ConditionStatus::from_bool(!snapshot.managed),
            reason: managed_reason.to_string(),
            message: managed_message,
            observed_generation,
            last_transition_time: None,
        },
        InventoryCondition {
            type_: CONDITION_INVENTORY_COMPLETE.to_string(),
            status: ConditionStatus::from_bool(complete),
            reason: complete_reason.to_string(),
            message: complete_message,
            observed_generation,
            last_transition_time: None,
        },
    ]
}

impl Reconciler {
    /// Brings the node's inventory record in line with the snapshot and the
    /// device records reconciled in this round.
    ///
    /// Returns a requeue request when a write raced with another actor.
    pub(crate) async fn reconcile_inventory(
        &self,
        owner: &OwnerReference,
        snapshot: &NodeSnapshot,
        managed_label_key: &str,
        records: &[GpuDevice],
    ) -> Result<Option<Requeue>, ControllerError> {
        let node_name = snapshot.node_name.as_str();

        let inventory = match self.store.get_inventory(node_name).await? {
            Some(inventory) => inventory,
            None if snapshot.devices.is_empty() => {
                debug!("Node {} has no GPU devices, not creating an inventory", node_name);
                return Ok(None);
            }
            None => {
                let mut inventory = GpuNodeInventory::new(
                    node_name,
                    GpuNodeInventorySpec {
                        node_name: node_name.to_string(),
                    },
                );
                inventory.metadata.owner_references = Some(vec![owner.clone()]);
                match self.store.create_inventory(&inventory).await {
                    Ok(created) => {
                        info!("Created GpuNodeInventory {}", node_name);
                        created
                    }
                    Err(StoreError::Conflict(_)) => {
                        debug!("GpuNodeInventory {} already exists, will retry", node_name);
                        return Ok(Some(Requeue::Immediate));
                    }
                    Err(e) => {
                        error!("Failed to create GpuNodeInventory {}: {}", node_name, e);
                        return Err(e.into());
                    }
                }
            }
        };

        let inventory = if inventory.spec.node_name == node_name {
            match metadata_patch(inventory.meta(), BTreeMap::new(), owner) {
                None => inventory,
                Some(patch) => match self.patch_inventory(node_name, &patch).await? {
                    Some(refetched) => refetched,
                    None => return Ok(Some(Requeue::Immediate)),
                },
            }
        } else {
            let patch = MetadataPatch {
                labels: BTreeMap::new(),
                owner_references: vec![owner.clone()],
                resource_version: inventory.resource_version(),
            };
            match self.patch_inventory(node_name, &patch).await? {
                Some(refetched) => refetched,
                None => return Ok(Some(Requeue::Immediate)),
            }
        };

        let mut summaries: Vec<GpuDeviceSummary> = records
            .iter()
            .map(|record| {
                let index = record
                    .status
                    .as_ref()
                    .map(|s| s.hardware.index.clone())
                    .filter(|i| !i.is_empty())
                    .or_else(|| record.labels().get(crds::DEVICE_INDEX_LABEL).cloned())
                    .unwrap_or_default();
                device_summary(node_name, record, snapshot.device(&index))
            })
            .collect();
        summaries.sort_by(|a, b| a.inventory_id.cmp(&b.inventory_id));

        let mut status = inventory.status.clone().unwrap_or_default();
        let mut changed = inventory.status.is_none();
        changed |= set_field(&mut status.hardware.devices, summaries);
        changed |= set_field(&mut status.hardware.driver, snapshot.driver.clone());

        let now = Utc::now();
        let mut transitions = Vec::new();
        for desired in desired_conditions(snapshot, managed_label_key, inventory.metadata.generation) {
            let condition_type = desired.type_.clone();
            let message = desired.message.clone();
            match upsert_condition(&mut status.conditions, desired, now) {
                ConditionChange::Unchanged => {}
                ConditionChange::Refreshed => changed = true,
                ConditionChange::Transitioned => {
                    changed = true;
                    transitions.push((condition_type, message));
                }
            }
        }

        if !changed {
            debug!("GpuNodeInventory {} already up-to-date", node_name);
            return Ok(None);
        }

        let mut desired = inventory.clone();
        desired.status = Some(status);
        let updated = match self.store.update_inventory_status(&desired).await {
            Ok(updated) => updated,
            Err(StoreError::Conflict(_) | StoreError::NotFound(_)) => {
                debug!("GpuNodeInventory {} changed while writing status, will retry", node_name);
                return Ok(Some(Requeue::Immediate));
            }
            Err(e) => {
                error!("Failed to update GpuNodeInventory {} status: {}", node_name, e);
                return Err(e.into());
            }
        };
        info!("Updated GpuNodeInventory {} status", node_name);

        let target = updated.object_ref(&());
        for (condition_type, message) in transitions {
            self.events
                .publish(&target, InventoryEvent::condition_changed(&condition_type, message))
                .await;
        }
        Ok(None)
    }

    /// Patches spec and metadata, then re-reads the record. `None` means the
    /// record moved underneath us.
    async fn patch_inventory(
        &self,
        node_name: &str,
        patch: &MetadataPatch,
    ) -> Result<Option<GpuNodeInventory>, ControllerError> {
        match self.store.patch_inventory_spec(node_name, node_name, patch).await {
            Ok(_) => {
                info!("Updated GpuNodeInventory {} spec and owner", node_name);
                Ok(self.store.get_inventory(node_name).await?)
            }
            Err(StoreError::Conflict(_) | StoreError::NotFound(_)) => {
                debug!("GpuNodeInventory {} changed while patching spec, will retry", node_name);
                Ok(None)
            }
            Err(e) => {
                error!("Failed to patch GpuNodeInventory {}: {}", node_name, e);
                Err(e.into())
            }
        }
    }
}
