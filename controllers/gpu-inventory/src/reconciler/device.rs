//! Device record reconciliation.
//!
//! Each discovered GPU maps to exactly one cluster-scoped `GpuDevice`. The
//! record is created once, then kept in line with the snapshot: metadata
//! first (labels and the owning Node), then status, one field at a time.

use std::collections::BTreeMap;

use crds::{
    DEVICE_INDEX_LABEL, DEVICE_NODE_LABEL, DeviceState, GpuDevice, GpuDeviceSpec, GpuDeviceStatus, GpuHealth,
};
use detection_client::DeviceDetection;
use gpu_discovery::DeviceSnapshot;
use gpu_discovery::parse::canonical_pci_address;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use tracing::{debug, error, info};

use super::{Reconciler, Requeue};
use crate::error::ControllerError;
use crate::events::{InventoryEvent, REASON_DEVICE_DISCOVERED};
use crate::reconcile_helpers::{metadata_patch, set_field, update_hardware, update_health};
use crate::store::StoreError;

/// Everything needed to reconcile one device record
#[derive(Debug)]
pub(crate) struct DeviceContext<'a> {
    pub node_name: &'a str,
    /// Owner reference pointing back at the node
    pub owner: &'a OwnerReference,
    /// Current discovery data for the device
    pub device: &'a DeviceSnapshot,
    pub managed: bool,
    pub auto_attach: bool,
    /// Live readings for this device, when the agent answered
    pub detection: Option<&'a DeviceDetection>,
}

/// Result of reconciling one device record
#[derive(Debug)]
pub(crate) struct DeviceOutcome {
    /// Latest known version of the record, if it exists
    pub record: Option<GpuDevice>,
    /// Set while the record is waiting on a status write
    pub requeue: Option<Requeue>,
}

impl DeviceOutcome {
    fn done(record: GpuDevice) -> Self {
        Self {
            record: Some(record),
            requeue: None,
        }
    }

    fn retry(record: Option<GpuDevice>) -> Self {
        Self {
            record,
            requeue: Some(Requeue::Immediate),
        }
    }
}

/// Merges live detection readings into a health block and PCI address.
///
/// Readings the agent did not report keep their previous value. The PCI
/// address is only filled in when discovery did not provide one.
pub fn merge_detection(
    health: &GpuHealth,
    pci_address: &str,
    detection: Option<&DeviceDetection>,
) -> (GpuHealth, String) {
    let Some(detection) = detection else {
        return (health.clone(), pci_address.to_string());
    };

    let mut merged = health.clone();
    merged.temperature_celsius = detection.temperature_celsius.or(health.temperature_celsius);
    merged.power_usage_watts = detection.power_usage_watts.or(health.power_usage_watts);
    merged.utilization_percent = detection.utilization_percent.or(health.utilization_percent);
    merged.memory_used_mib = detection.memory_used_mib.or(health.memory_used_mib);

    match detection.mig_enabled() {
        Some(enabled) => {
            merged.mig_enabled = Some(enabled);
            let mut instances = if enabled {
                detection.mig_profiles.clone()
            } else {
                Vec::new()
            };
            instances.sort();
            instances.dedup();
            merged.mig_instances = instances;
        }
        None if !detection.mig_profiles.is_empty() => {
            let mut instances = detection.mig_profiles.clone();
            instances.sort();
            instances.dedup();
            merged.mig_instances = instances;
        }
        None => {}
    }

    let pci = if pci_address.is_empty() {
        canonical_pci_address(&detection.pci_address)
    } else {
        pci_address.to_string()
    };
    (merged, pci)
}

/// Labels every device record carries.
pub(crate) fn device_record_labels(node_name: &str, index: &str) -> BTreeMap<String, String> {
    [
        (DEVICE_NODE_LABEL.to_string(), node_name.to_string()),
        (DEVICE_INDEX_LABEL.to_string(), index.to_string()),
    ]
    .into_iter()
    .collect()
}

impl Reconciler {
    /// Drives the record of one discovered device to match its snapshot.
    ///
    /// Conflicts and vanished objects are reported as an immediate requeue,
    /// never as an error.
    pub(crate) async fn reconcile_device(&self, ctx: &DeviceContext<'_>) -> Result<DeviceOutcome, ControllerError> {
        let name = ctx.device.record_name(ctx.node_name);
        match self.store.get_device(&name).await? {
            None => self.create_device(&name, ctx).await,
            Some(existing) => self.update_device(&name, existing, ctx).await,
        }
    }

    async fn create_device(&self, name: &str, ctx: &DeviceContext<'_>) -> Result<DeviceOutcome, ControllerError> {
        let mut record = GpuDevice::new(name, GpuDeviceSpec {});
        record.metadata.labels = Some(device_record_labels(ctx.node_name, &ctx.device.index));
        record.metadata.owner_references = Some(vec![ctx.owner.clone()]);

        let created = match self.store.create_device(&record).await {
            Ok(created) => created,
            Err(StoreError::Conflict(what)) => {
                debug!("{} already exists, will retry", what);
                return Ok(DeviceOutcome::retry(None));
            }
            Err(e) => {
                error!("Failed to create GpuDevice {}: {}", name, e);
                return Err(e.into());
            }
        };
        info!(
            "Created GpuDevice {} for device {} on node {}",
            name, ctx.device.index, ctx.node_name
        );
        self.events
            .publish(
                &created.object_ref(&()),
                InventoryEvent::normal(
                    REASON_DEVICE_DISCOVERED,
                    "Create",
                    format!(
                        "Discovered GPU {} ({}:{}) at index {} on node {}",
                        display_product(ctx.device),
                        ctx.device.vendor,
                        ctx.device.device,
                        ctx.device.index,
                        ctx.node_name
                    ),
                ),
            )
            .await;

        let (health, pci_address) = merge_detection(&GpuHealth::default(), &ctx.device.pci_address, ctx.detection);
        let mut hardware = ctx.device.to_hardware();
        hardware.pci_address = pci_address;
        let mut with_status = created.clone();
        with_status.status = Some(GpuDeviceStatus {
            node_name: ctx.node_name.to_string(),
            inventory_id: ctx.device.inventory_id(ctx.node_name),
            managed: ctx.managed,
            auto_attach: ctx.auto_attach,
            state: DeviceState::Discovered,
            hardware,
            health,
        });
        self.write_status(name, with_status, created).await
    }

    async fn update_device(
        &self,
        name: &str,
        existing: GpuDevice,
        ctx: &DeviceContext<'_>,
    ) -> Result<DeviceOutcome, ControllerError> {
        let labels = device_record_labels(ctx.node_name, &ctx.device.index);
        let existing = match metadata_patch(existing.meta(), labels, ctx.owner) {
            None => existing,
            Some(patch) => {
                match self.store.patch_device_metadata(name, &patch).await {
                    Ok(_) => {}
                    Err(StoreError::Conflict(_) | StoreError::NotFound(_)) => {
                        debug!("GpuDevice {} changed while patching metadata, will retry", name);
                        return Ok(DeviceOutcome::retry(Some(existing)));
                    }
                    Err(e) => {
                        error!("Failed to patch GpuDevice {} metadata: {}", name, e);
                        return Err(e.into());
                    }
                }
                info!("Updated GpuDevice {} labels and owner", name);
                match self.store.get_device(name).await? {
                    Some(refetched) => refetched,
                    None => return Ok(DeviceOutcome::retry(None)),
                }
            }
        };

        let mut status = existing.status.clone().unwrap_or_default();
        let mut changed = existing.status.is_none();
        changed |= set_field(&mut status.node_name, ctx.node_name.to_string());
        changed |= set_field(&mut status.inventory_id, ctx.device.inventory_id(ctx.node_name));
        changed |= set_field(&mut status.managed, ctx.managed);
        changed |= set_field(&mut status.auto_attach, ctx.auto_attach);

        // Keep a PCI address learned from detection when discovery has none.
        let base_pci = if ctx.device.pci_address.is_empty() {
            status.hardware.pci_address.clone()
        } else {
            ctx.device.pci_address.clone()
        };
        let (health, pci_address) = merge_detection(&status.health, &base_pci, ctx.detection);
        let mut hardware = ctx.device.to_hardware();
        hardware.pci_address = pci_address;
        changed |= update_hardware(&mut status.hardware, hardware);
        changed |= update_health(&mut status.health, health);

        if !changed {
            debug!("GpuDevice {} already up-to-date", name);
            return Ok(DeviceOutcome::done(existing));
        }

        let mut desired = existing.clone();
        desired.status = Some(status);
        self.write_status(name, desired, existing).await
    }

    /// Writes `desired.status`; on a conflict the round is retried with
    /// `fallback` as the latest known record.
    async fn write_status(
        &self,
        name: &str,
        desired: GpuDevice,
        fallback: GpuDevice,
    ) -> Result<DeviceOutcome, ControllerError> {
        match self.store.update_device_status(&desired).await {
            Ok(updated) => {
                info!("Updated GpuDevice {} status", name);
                Ok(DeviceOutcome::done(updated))
            }
            Err(StoreError::Conflict(_) | StoreError::NotFound(_)) => {
                debug!("GpuDevice {} changed while writing status, will retry", name);
                Ok(DeviceOutcome::retry(Some(fallback)))
            }
            Err(e) => {
                error!("Failed to update GpuDevice {} status: {}", name, e);
                Err(e.into())
            }
        }
    }
}

fn display_product(device: &DeviceSnapshot) -> &str {
    if device.product.is_empty() {
        "unknown product"
    } else {
        &device.product
    }
}
