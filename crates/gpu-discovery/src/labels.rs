//! Label keys consumed by the snapshot builder.

/// Prefix of per-device labels: `<prefix><index>.<field>`
pub const DEVICE_LABEL_PREFIX: &str = "gpu.dcops.microscaler.io/device.";

/// Per-device label fields
pub const FIELD_VENDOR: &str = "vendor";
pub const FIELD_DEVICE: &str = "device";
pub const FIELD_CLASS: &str = "class";
pub const FIELD_PRODUCT: &str = "product";
pub const FIELD_MEMORY: &str = "memoryMiB";
pub const FIELD_UUID: &str = "uuid";
pub const FIELD_PCI_ADDRESS: &str = "pciAddress";

/// Managed-node label used when no key is configured
pub const DEFAULT_MANAGED_LABEL: &str = "gpu.dcops.microscaler.io/enabled";

/// PCI vendor id of the only GPU vendor the controller inventories
pub const NVIDIA_VENDOR_ID: &str = "10de";

/// Node label NFD sets when a PCI device of the GPU vendor is present
pub const NFD_GPU_PRESENT_LABEL: &str = "feature.node.kubernetes.io/pci-10de.present";

/// Instance feature set carrying per-GPU attributes in a NodeFeature
pub const GPU_INSTANCE_FEATURE: &str = "nvidia.com/gpu";

// Node-level hardware defaults
pub const GPU_PRODUCT: &str = "nvidia.com/gpu.product";
pub const GPU_MEMORY: &str = "nvidia.com/gpu.memory";
pub const GPU_COMPUTE_MAJOR: &str = "nvidia.com/gpu.compute.major";
pub const GPU_COMPUTE_MINOR: &str = "nvidia.com/gpu.compute.minor";
pub const GPU_FAMILY: &str = "nvidia.com/gpu.family";
pub const GPU_BOARD: &str = "nvidia.com/gpu.board";
pub const GPU_SERIAL: &str = "nvidia.com/gpu.serial";
pub const GPU_PSTATE: &str = "nvidia.com/gpu.pstate";
pub const GPU_DISPLAY_MODE: &str = "nvidia.com/gpu.display-mode";

// MIG, primary spelling first
pub const MIG_CAPABLE: &str = "nvidia.com/mig.capable";
pub const MIG_CAPABLE_LEGACY: &str = "nvidia.com/mig-capable";
pub const MIG_STRATEGY: &str = "nvidia.com/mig.strategy";
pub const MIG_STRATEGY_LEGACY: &str = "nvidia.com/mig-strategy";
/// Prefix of per-profile capacity labels: `nvidia.com/mig-<size>.<memory>.<metric>`
pub const MIG_PROFILE_PREFIX: &str = "nvidia.com/mig-";

// Driver stack
pub const DRIVER_VERSION_FULL: &str = "nvidia.com/cuda.driver-version.full";
pub const DRIVER_MAJOR: &str = "nvidia.com/cuda.driver.major";
pub const DRIVER_MINOR: &str = "nvidia.com/cuda.driver.minor";
pub const DRIVER_REV: &str = "nvidia.com/cuda.driver.rev";
pub const CUDA_RUNTIME_FULL: &str = "nvidia.com/cuda.runtime-version.full";
pub const CUDA_RUNTIME_MAJOR: &str = "nvidia.com/cuda.runtime.major";
pub const CUDA_RUNTIME_MINOR: &str = "nvidia.com/cuda.runtime.minor";
pub const TOOLKIT_INSTALLED: &str = "gpu.dcops.microscaler.io/toolkit.installed";
pub const TOOLKIT_READY: &str = "gpu.dcops.microscaler.io/toolkit.ready";

// NodeFeature instance attributes
pub const ATTR_INDEX: &str = "index";
pub const ATTR_UUID: &str = "uuid";
pub const ATTR_PCI_ADDRESS: &str = "pci.address";
pub const ATTR_VENDOR: &str = "vendor";
pub const ATTR_DEVICE: &str = "device";
pub const ATTR_CLASS: &str = "class";
pub const ATTR_PRODUCT: &str = "product";
pub const ATTR_MEMORY_TOTAL: &str = "memory.total";
pub const ATTR_COMPUTE_MAJOR: &str = "compute.major";
pub const ATTR_COMPUTE_MINOR: &str = "compute.minor";
pub const ATTR_PRECISION: &str = "precision";
pub const ATTR_NUMA_NODE: &str = "numa.node";
pub const ATTR_POWER_LIMIT: &str = "power.limit";
pub const ATTR_SM_COUNT: &str = "sm.count";
pub const ATTR_MEMORY_BANDWIDTH: &str = "memory.bandwidth";
pub const ATTR_PCIE_GENERATION: &str = "pcie.generation";
pub const ATTR_PCIE_WIDTH: &str = "pcie.width";
pub const ATTR_BOARD: &str = "board";
pub const ATTR_FAMILY: &str = "family";
pub const ATTR_SERIAL: &str = "serial";
pub const ATTR_PSTATE: &str = "pstate";
pub const ATTR_DISPLAY_MODE: &str = "display.mode";
