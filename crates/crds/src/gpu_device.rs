//! GpuDevice Custom Resource Definition
//!
//! One `GpuDevice` exists per GPU discovered on a node. The object carries no
//! desired state: everything interesting lives in `status`, which mirrors the
//! hardware snapshot built from node labels and NodeFeature data, plus the
//! fields the controller assigns (managed flag, auto-attach decision,
//! lifecycle state, health).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::mig::MigCapability;

/// Label carrying the name of the node a device record belongs to
pub const DEVICE_NODE_LABEL: &str = "gpu.dcops.microscaler.io/node";
/// Label carrying the canonical device index
pub const DEVICE_INDEX_LABEL: &str = "gpu.dcops.microscaler.io/device-index";

/// GpuDeviceSpec is intentionally empty; device records are status-only.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "gpu.dcops.microscaler.io",
    version = "v1alpha1",
    kind = "GpuDevice",
    status = "GpuDeviceStatus",
    shortname = "gpudev",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#,
    printcolumn = r#"{"name":"Product","type":"string","jsonPath":".status.hardware.product"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"AutoAttach","type":"boolean","jsonPath":".status.autoAttach"}"#
)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::empty_structs_with_brackets, reason = "CRD spec must serialize as an object")]
pub struct GpuDeviceSpec {}

/// Lifecycle state of a device record
///
/// The inventory controller only ever assigns `Discovered`; later states are
/// owned by the agents that validate and hand out devices.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum DeviceState {
    /// Device has been seen on the node and recorded
    #[default]
    Discovered,
    /// Device is being validated by the node agent
    Validating,
    /// Device passed validation and can be assigned
    Ready,
    /// Device is assigned to a consumer
    Assigned,
    /// Device is used by a running workload
    InUse,
    /// Device reported a hardware fault
    Faulted,
}

/// Hardware description of a single GPU
///
/// Optional numeric fields distinguish "unknown" (`None`) from a real zero.
/// Fields are always serialized (no `skip_serializing_if`) so a merge patch
/// can clear a value that disappeared from the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuHardware {
    /// Canonical device index on the node
    pub index: String,
    /// PCI vendor id (lower-case hex)
    pub vendor: String,
    /// PCI device id (lower-case hex)
    pub device: String,
    /// PCI class id (lower-case hex)
    pub class: String,
    /// PCI bus address in `dddd:bb:dd.f` form
    pub pci_address: String,
    /// Marketing product name
    pub product: String,
    /// Total device memory
    #[serde(rename = "memoryMiB")]
    pub memory_mib: i64,
    /// CUDA compute capability, major part
    pub compute_major: i32,
    /// CUDA compute capability, minor part
    pub compute_minor: i32,
    /// Device UUID reported by the driver
    pub uuid: String,
    /// Supported numeric precisions, sorted and deduplicated
    pub precisions: Vec<String>,
    /// NUMA node the device is attached to
    pub numa_node: Option<i32>,
    /// Board power limit
    pub power_limit_watts: Option<i32>,
    /// Streaming multiprocessor count
    pub sm_count: Option<i32>,
    /// Peak memory bandwidth
    pub memory_bandwidth_mbps: Option<i32>,
    /// Negotiated PCIe generation
    pub pcie_generation: Option<i32>,
    /// Negotiated PCIe lane width
    pub pcie_width: Option<i32>,
    /// Board part number
    pub board: String,
    /// Architecture family
    pub family: String,
    /// Board serial number
    pub serial: String,
    /// Performance state, e.g. `P0`
    pub pstate: String,
    /// Display mode, e.g. `Disabled`
    pub display_mode: String,
    /// MIG support and advertised profiles
    pub mig: MigCapability,
}

/// Live health readings merged from the node detection agent
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuHealth {
    /// Core temperature
    pub temperature_celsius: Option<i32>,
    /// Current power draw
    pub power_usage_watts: Option<i32>,
    /// GPU utilization
    pub utilization_percent: Option<i32>,
    /// Device memory in use
    #[serde(rename = "memoryUsedMiB")]
    pub memory_used_mib: Option<i64>,
    /// MIG mode currently enabled
    pub mig_enabled: Option<bool>,
    /// MIG instances currently carved out of the device
    pub mig_instances: Vec<String>,
}

/// GpuDeviceStatus defines the observed state of a GPU
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuDeviceStatus {
    /// Node hosting the device
    pub node_name: String,

    /// Stable identifier used in the node inventory summary
    pub inventory_id: String,

    /// Whether the hosting node is managed by the controller
    pub managed: bool,

    /// Whether the device may be handed to workloads without operator approval
    pub auto_attach: bool,

    /// Lifecycle state
    pub state: DeviceState,

    /// Hardware snapshot
    pub hardware: GpuHardware,

    /// Health readings (empty when no detection data is available)
    pub health: GpuHealth,
}
