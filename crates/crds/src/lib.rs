//! GPU Inventory CRD Definitions
//!
//! Kubernetes Custom Resource Definitions produced by the GPU inventory
//! controller (`GpuDevice`, `GpuNodeInventory`) and the Node Feature Discovery
//! `NodeFeature` resource it consumes.

pub mod gpu_device;
pub mod gpu_node_inventory;
pub mod mig;
pub mod node_feature;

pub use gpu_device::*;
pub use gpu_node_inventory::*;
pub use mig::*;
pub use node_feature::*;

/// API group of the resources owned by the inventory controller
pub const GROUP: &str = "gpu.dcops.microscaler.io";
