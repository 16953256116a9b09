//! GpuNodeInventory Custom Resource Definition
//!
//! One inventory record per node that has ever reported a GPU. The record
//! aggregates the node's current `GpuDevice` objects and carries the
//! node-level status conditions.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::gpu_device::DeviceState;

/// Condition type: node is excluded from GPU management
pub const CONDITION_MANAGED_DISABLED: &str = "ManagedDisabled";
/// Condition type: discovery data was observed and devices were found
pub const CONDITION_INVENTORY_COMPLETE: &str = "InventoryComplete";

/// GpuNodeInventorySpec carries the back-reference to the node
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "gpu.dcops.microscaler.io",
    version = "v1alpha1",
    kind = "GpuNodeInventory",
    status = "GpuNodeInventoryStatus",
    shortname = "gpuinv",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Driver","type":"string","jsonPath":".status.hardware.driver.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GpuNodeInventorySpec {
    /// Name of the node this inventory describes
    #[serde(default)]
    pub node_name: String,
}

/// Condition status values
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// Not yet evaluated
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// `True` for true, `False` for false.
    pub fn from_bool(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Status condition of an inventory record
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InventoryCondition {
    /// Condition type, e.g. `ManagedDisabled` or `InventoryComplete`
    #[serde(rename = "type")]
    pub type_: String,
    /// Whether the condition holds
    pub status: ConditionStatus,
    /// CamelCase reason for the last transition
    #[serde(default)]
    pub reason: String,
    /// Human readable detail
    #[serde(default)]
    pub message: String,
    /// Generation the condition was computed for
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// When the status last changed
    #[serde(default)]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Driver stack installed on the node
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverInfo {
    /// NVIDIA driver version
    pub version: String,
    /// CUDA runtime version
    pub cuda_version: String,
    /// GPU toolkit is installed on the node
    pub toolkit_installed: bool,
    /// GPU toolkit reports ready
    pub toolkit_ready: bool,
}

/// Summary of one device as listed in the inventory
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuDeviceSummary {
    /// Stable identity `<node>/<index>`
    pub inventory_id: String,
    /// Name of the backing GpuDevice object
    pub device_name: String,
    /// Canonical device index
    pub index: String,
    /// PCI vendor id (lower-case hex)
    pub vendor: String,
    /// PCI device id (lower-case hex)
    pub device: String,
    /// Marketing product name
    pub product: String,
    /// Device UUID reported by the driver
    pub uuid: String,
    /// PCI bus address
    pub pci_address: String,
    /// Total device memory
    #[serde(rename = "memoryMiB")]
    pub memory_mib: i64,
    /// Device supports MIG partitioning
    pub mig_capable: bool,
    /// Approval state of the device
    pub state: DeviceState,
    /// Node is managed by the controller
    pub managed: bool,
    /// Device is approved for automatic attachment
    pub auto_attach: bool,
}

/// Aggregated node hardware
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeHardware {
    /// One entry per discovered device, sorted by index
    pub devices: Vec<GpuDeviceSummary>,
    /// Node driver stack
    pub driver: DriverInfo,
}

/// GpuNodeInventoryStatus defines the observed inventory of a node
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuNodeInventoryStatus {
    /// Discovered hardware
    pub hardware: NodeHardware,
    /// `ManagedDisabled` and `InventoryComplete` conditions
    pub conditions: Vec<InventoryCondition>,
}

impl GpuNodeInventoryStatus {
    /// Looks up a condition by type.
    pub fn condition(&self, type_: &str) -> Option<&InventoryCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
