//! Snapshot builder
//!
//! Merges node labels and NodeFeature data into a [`NodeSnapshot`]. The
//! merge order is fixed:
//!
//! 1. node labels form the base, NodeFeature labels only fill missing keys;
//! 2. per-device labels (`gpu.dcops.microscaler.io/device.<index>.<field>`)
//!    produce candidate devices;
//! 3. candidates are deduplicated by UUID, then by PCI address;
//! 4. devices of other vendors or with an incomplete PCI id triple are dropped;
//! 5. node-level `nvidia.com/gpu.*` labels backfill empty device fields;
//! 6. NodeFeature instances enrich devices by index (and may add devices);
//! 7. the hardware catalog backfills missing product names;
//! 8. devices are sorted by index with no duplicate identity.

use std::collections::BTreeMap;
use std::sync::Arc;

use crds::{DriverInfo, GpuHardware, MigCapability, NodeFeature};
use ring::digest;
use tracing::debug;

use crate::catalog::HardwareCatalog;
use crate::labels::*;
use crate::mig::parse_mig;
use crate::parse::{
    canonical_index, canonical_pci_address, compare_indices, normalize_hex_id, parse_bool,
    parse_leading_int, parse_memory_mib, parse_precisions,
};

/// Longest DNS-1123 subdomain name
const MAX_NAME_LEN: usize = 253;

/// One discovered GPU on one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    /// Canonical device index
    pub index: String,
    /// PCI vendor id (lower-case hex)
    pub vendor: String,
    /// PCI device id (lower-case hex)
    pub device: String,
    /// PCI class id (lower-case hex)
    pub class: String,
    /// PCI bus address
    pub pci_address: String,
    /// Product name, from labels or the hardware catalog
    pub product: String,
    /// Total device memory in MiB
    pub memory_mib: i64,
    /// CUDA compute capability, major part
    pub compute_major: i32,
    /// CUDA compute capability, minor part
    pub compute_minor: i32,
    /// Device UUID
    pub uuid: String,
    /// Supported numeric precisions, sorted and deduplicated
    pub precisions: Vec<String>,
    /// NUMA node the device is attached to
    pub numa_node: Option<i32>,
    /// Board power limit in watts
    pub power_limit_watts: Option<i32>,
    /// Streaming multiprocessor count
    pub sm_count: Option<i32>,
    /// Peak memory bandwidth in MB/s
    pub memory_bandwidth_mbps: Option<i32>,
    /// PCIe generation
    pub pcie_generation: Option<i32>,
    /// PCIe lane width
    pub pcie_width: Option<i32>,
    /// Board part number
    pub board: String,
    /// Architecture family
    pub family: String,
    /// Board serial number
    pub serial: String,
    /// Performance state
    pub pstate: String,
    /// Display mode
    pub display_mode: String,
    /// MIG capability and profiles
    pub mig: MigCapability,
    /// Raw per-index labels, carried through for selector evaluation
    pub labels: BTreeMap<String, String>,
}

impl DeviceSnapshot {
    /// Identity key within a node: `(index, vendor, device)`.
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.index, &self.vendor, &self.device)
    }

    /// Stable name of the device record for this device on `node`.
    ///
    /// When sanitizing alters the raw identity, a digest of the raw form is
    /// appended so that distinct indices such as `A_1` and `a-1` never share
    /// a record.
    pub fn record_name(&self, node: &str) -> String {
        let raw = format!("{}-{}-{}-{}", node, self.index, self.vendor, self.device);
        let name = sanitize_name(&raw);
        if name == raw {
            return name;
        }
        let suffix = identity_digest(&raw);
        let mut name = name;
        name.truncate(MAX_NAME_LEN - suffix.len() - 1);
        let name = name.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
        if name.is_empty() {
            suffix
        } else {
            format!("{name}-{suffix}")
        }
    }

    /// Identifier used in the node inventory summary.
    pub fn inventory_id(&self, node: &str) -> String {
        format!("{}/{}", node, self.index)
    }

    /// How strong the device identity is: UUID beats PCI address beats nothing.
    fn identity_rank(&self) -> u8 {
        if !self.uuid.is_empty() {
            2
        } else if !self.pci_address.is_empty() {
            1
        } else {
            0
        }
    }

    /// Whether two candidates describe the same physical device.
    fn same_device(&self, other: &DeviceSnapshot) -> bool {
        if !self.uuid.is_empty() && !other.uuid.is_empty() {
            return self.uuid.eq_ignore_ascii_case(&other.uuid);
        }
        !self.pci_address.is_empty() && self.pci_address == other.pci_address
    }

    fn has_pci_triple(&self) -> bool {
        !self.vendor.is_empty() && !self.device.is_empty() && !self.class.is_empty()
    }

    /// Hardware block of the device record status.
    pub fn to_hardware(&self) -> GpuHardware {
        GpuHardware {
            index: self.index.clone(),
            vendor: self.vendor.clone(),
            device: self.device.clone(),
            class: self.class.clone(),
            pci_address: self.pci_address.clone(),
            product: self.product.clone(),
            memory_mib: self.memory_mib,
            compute_major: self.compute_major,
            compute_minor: self.compute_minor,
            uuid: self.uuid.clone(),
            precisions: self.precisions.clone(),
            numa_node: self.numa_node,
            power_limit_watts: self.power_limit_watts,
            sm_count: self.sm_count,
            memory_bandwidth_mbps: self.memory_bandwidth_mbps,
            pcie_generation: self.pcie_generation,
            pcie_width: self.pcie_width,
            board: self.board.clone(),
            family: self.family.clone(),
            serial: self.serial.clone(),
            pstate: self.pstate.clone(),
            display_mode: self.display_mode.clone(),
            mig: self.mig.clone(),
        }
    }
}

/// Canonical view of one node's GPU hardware
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSnapshot {
    pub node_name: String,
    /// Whether the managed-nodes policy selects this node
    pub managed: bool,
    /// A NodeFeature object or the NFD GPU presence label was observed
    pub feature_source_detected: bool,
    /// Driver stack from node labels
    pub driver: DriverInfo,
    /// Sorted by canonical index, unique by identity
    pub devices: Vec<DeviceSnapshot>,
    /// Node labels overlaid with NodeFeature labels for missing keys
    pub labels: BTreeMap<String, String>,
}

impl NodeSnapshot {
    /// Looks up a device by canonical index.
    pub fn device(&self, index: &str) -> Option<&DeviceSnapshot> {
        self.devices.iter().find(|d| d.index == index)
    }
}

/// Which nodes the controller manages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedNodesPolicy {
    /// Label that opts a node out when set to `false`
    pub label_key: String,
    /// Managed state of nodes without the label
    pub enabled_by_default: bool,
}

impl Default for ManagedNodesPolicy {
    fn default() -> Self {
        Self {
            label_key: DEFAULT_MANAGED_LABEL.to_string(),
            enabled_by_default: true,
        }
    }
}

impl ManagedNodesPolicy {
    /// Label key in effect, falling back to the default key when unset.
    pub fn effective_label_key(&self) -> &str {
        if self.label_key.is_empty() {
            DEFAULT_MANAGED_LABEL
        } else {
            &self.label_key
        }
    }

    /// Evaluates the policy against a label map.
    pub fn is_managed(&self, labels: &BTreeMap<String, String>) -> bool {
        match labels.get(self.effective_label_key()) {
            Some(value) => !value.trim().eq_ignore_ascii_case("false"),
            None => self.enabled_by_default,
        }
    }
}

/// Hardware defaults published once per node
#[derive(Debug, Default)]
struct NodeDefaults {
    product: String,
    memory_mib: i64,
    compute_major: i32,
    compute_minor: i32,
    family: String,
    board: String,
    serial: String,
    pstate: String,
    display_mode: String,
    mig: MigCapability,
}

impl NodeDefaults {
    fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        let text = |key: &str| labels.get(key).map(|v| v.trim().to_string()).unwrap_or_default();
        let int = |key: &str| labels.get(key).and_then(|v| parse_leading_int(v)).unwrap_or(0);
        Self {
            product: text(GPU_PRODUCT),
            memory_mib: labels.get(GPU_MEMORY).map(|v| parse_memory_mib(v)).unwrap_or(0),
            compute_major: int(GPU_COMPUTE_MAJOR),
            compute_minor: int(GPU_COMPUTE_MINOR),
            family: text(GPU_FAMILY),
            board: text(GPU_BOARD),
            serial: text(GPU_SERIAL),
            pstate: text(GPU_PSTATE),
            display_mode: text(GPU_DISPLAY_MODE),
            mig: parse_mig(labels),
        }
    }

    fn backfill(&self, device: &mut DeviceSnapshot) {
        fill_string(&mut device.product, &self.product);
        fill_string(&mut device.family, &self.family);
        fill_string(&mut device.board, &self.board);
        fill_string(&mut device.serial, &self.serial);
        fill_string(&mut device.pstate, &self.pstate);
        fill_string(&mut device.display_mode, &self.display_mode);
        if device.memory_mib == 0 {
            device.memory_mib = self.memory_mib;
        }
        if device.compute_major == 0 && device.compute_minor == 0 {
            device.compute_major = self.compute_major;
            device.compute_minor = self.compute_minor;
        }
        if device.mig.is_empty() {
            device.mig = self.mig.clone();
        }
    }
}

fn fill_string(target: &mut String, value: &str) {
    if target.is_empty() && !value.is_empty() {
        *target = value.to_string();
    }
}

/// Builds node snapshots
///
/// The catalog is injected so tests can substitute their own table.
#[derive(Clone)]
pub struct SnapshotBuilder {
    catalog: Arc<dyn HardwareCatalog>,
}

impl std::fmt::Debug for SnapshotBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotBuilder").finish_non_exhaustive()
    }
}

impl SnapshotBuilder {
    /// Builder backed by `catalog` for product and capability lookups.
    pub fn new(catalog: Arc<dyn HardwareCatalog>) -> Self {
        Self { catalog }
    }

    /// Builds the snapshot of `node_name`. Never fails.
    pub fn build(
        &self,
        node_name: &str,
        node_labels: &BTreeMap<String, String>,
        feature: Option<&NodeFeature>,
        policy: &ManagedNodesPolicy,
    ) -> NodeSnapshot {
        let mut labels = node_labels.clone();
        if let Some(feature) = feature {
            for (key, value) in feature.namespaced_labels() {
                labels.entry(key).or_insert(value);
            }
        }

        let candidates = extract_label_devices(&labels);
        let mut devices = dedup_devices(candidates);
        devices.retain(|d| {
            let keep = d.vendor == NVIDIA_VENDOR_ID && d.has_pci_triple();
            if !keep {
                debug!(
                    "Skipping device {} on node {}: vendor={:?} device={:?} class={:?}",
                    d.index, node_name, d.vendor, d.device, d.class
                );
            }
            keep
        });

        let defaults = NodeDefaults::from_labels(&labels);
        for device in &mut devices {
            defaults.backfill(device);
        }

        if let Some(feature) = feature {
            for attributes in feature.instances(GPU_INSTANCE_FEATURE) {
                let index = canonical_index(attributes.get(ATTR_INDEX).map_or("", String::as_str));
                if let Some(device) = devices.iter_mut().find(|d| d.index == index) {
                    apply_instance(device, attributes);
                    continue;
                }

                let mut device = DeviceSnapshot {
                    index,
                    ..Default::default()
                };
                apply_instance(&mut device, attributes);
                if device.vendor != NVIDIA_VENDOR_ID || !device.has_pci_triple() {
                    debug!(
                        "Skipping NodeFeature instance {} on node {}: incomplete PCI ids",
                        device.index, node_name
                    );
                    continue;
                }
                devices.push(device);
            }
            for device in &mut devices {
                defaults.backfill(device);
            }
        }

        for device in &mut devices {
            if device.product.is_empty() {
                if let Some(name) = self.catalog.product_name(&device.vendor, &device.device) {
                    device.product = name;
                }
            }
        }

        devices.sort_by(|a, b| compare_indices(&a.index, &b.index));
        let mut unique: Vec<DeviceSnapshot> = Vec::with_capacity(devices.len());
        for device in devices {
            if !unique.iter().any(|d| d.identity() == device.identity()) {
                unique.push(device);
            }
        }

        NodeSnapshot {
            node_name: node_name.to_string(),
            managed: policy.is_managed(&labels),
            feature_source_detected: feature.is_some()
                || labels
                    .get(NFD_GPU_PRESENT_LABEL)
                    .and_then(|v| parse_bool(v))
                    .unwrap_or(false),
            driver: driver_info(&labels),
            devices: unique,
            labels,
        }
    }
}

/// Collects candidate devices from `<prefix><index>.<field>` labels, in
/// index-key order.
fn extract_label_devices(labels: &BTreeMap<String, String>) -> Vec<DeviceSnapshot> {
    let mut by_index: Vec<DeviceSnapshot> = Vec::new();

    for (key, value) in labels {
        let Some(suffix) = key.strip_prefix(DEVICE_LABEL_PREFIX) else {
            continue;
        };
        let parts: Vec<&str> = suffix.split('.').collect();
        let [raw_index, field] = parts.as_slice() else {
            continue;
        };
        let index = canonical_index(raw_index);

        let position = match by_index.iter().position(|d| d.index == index) {
            Some(position) => position,
            None => {
                by_index.push(DeviceSnapshot {
                    index,
                    ..Default::default()
                });
                by_index.len() - 1
            }
        };
        let device = &mut by_index[position];
        device.labels.insert(key.clone(), value.clone());

        match *field {
            FIELD_VENDOR => device.vendor = normalize_hex_id(value),
            FIELD_DEVICE => device.device = normalize_hex_id(value),
            FIELD_CLASS => device.class = normalize_hex_id(value),
            FIELD_PRODUCT => device.product = value.trim().to_string(),
            FIELD_MEMORY => device.memory_mib = parse_memory_mib(value),
            FIELD_UUID => device.uuid = value.trim().to_string(),
            FIELD_PCI_ADDRESS => device.pci_address = canonical_pci_address(value),
            _ => {}
        }
    }

    by_index
}

/// Collapses candidates describing the same physical device, keeping the
/// one with the richer identity. Ties keep the first seen.
fn dedup_devices(candidates: Vec<DeviceSnapshot>) -> Vec<DeviceSnapshot> {
    let mut kept: Vec<DeviceSnapshot> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match kept.iter().position(|d| d.same_device(&candidate)) {
            Some(position) => {
                if candidate.identity_rank() > kept[position].identity_rank() {
                    kept[position] = candidate;
                }
            }
            None => kept.push(candidate),
        }
    }
    kept
}

/// Applies NodeFeature instance attributes. Identity and descriptive fields
/// only fill gaps; numeric metrics and precision overwrite when parsable.
fn apply_instance(device: &mut DeviceSnapshot, attributes: &BTreeMap<String, String>) {
    let get = |key: &str| attributes.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    if let Some(v) = get(ATTR_UUID) {
        fill_string(&mut device.uuid, v);
    }
    if let Some(v) = get(ATTR_PCI_ADDRESS) {
        fill_string(&mut device.pci_address, &canonical_pci_address(v));
    }
    if let Some(v) = get(ATTR_VENDOR) {
        fill_string(&mut device.vendor, &normalize_hex_id(v));
    }
    if let Some(v) = get(ATTR_DEVICE) {
        fill_string(&mut device.device, &normalize_hex_id(v));
    }
    if let Some(v) = get(ATTR_CLASS) {
        fill_string(&mut device.class, &normalize_hex_id(v));
    }
    for (key, target) in [
        (ATTR_PRODUCT, &mut device.product),
        (ATTR_BOARD, &mut device.board),
        (ATTR_FAMILY, &mut device.family),
        (ATTR_SERIAL, &mut device.serial),
        (ATTR_PSTATE, &mut device.pstate),
        (ATTR_DISPLAY_MODE, &mut device.display_mode),
    ] {
        if let Some(v) = get(key) {
            fill_string(target, v);
        }
    }

    if let Some(memory) = get(ATTR_MEMORY_TOTAL).map(parse_memory_mib).filter(|m| *m > 0) {
        device.memory_mib = memory;
    }
    if let Some(major) = get(ATTR_COMPUTE_MAJOR).and_then(parse_leading_int) {
        device.compute_major = major;
    }
    if let Some(minor) = get(ATTR_COMPUTE_MINOR).and_then(parse_leading_int) {
        device.compute_minor = minor;
    }
    if let Some(precisions) = get(ATTR_PRECISION).map(parse_precisions).filter(|p| !p.is_empty()) {
        device.precisions = precisions;
    }
    for (key, target) in [
        (ATTR_NUMA_NODE, &mut device.numa_node),
        (ATTR_POWER_LIMIT, &mut device.power_limit_watts),
        (ATTR_SM_COUNT, &mut device.sm_count),
        (ATTR_MEMORY_BANDWIDTH, &mut device.memory_bandwidth_mbps),
        (ATTR_PCIE_GENERATION, &mut device.pcie_generation),
        (ATTR_PCIE_WIDTH, &mut device.pcie_width),
    ] {
        if let Some(value) = get(key).and_then(parse_leading_int) {
            *target = Some(value);
        }
    }
}

fn driver_info(labels: &BTreeMap<String, String>) -> DriverInfo {
    let get = |key: &str| labels.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
    let dotted = |keys: &[&str]| -> String {
        let parts: Vec<&str> = keys.iter().map_while(|key| get(*key)).collect();
        if parts.len() == keys.len() {
            parts.join(".")
        } else {
            String::new()
        }
    };

    let version = get(DRIVER_VERSION_FULL)
        .map(str::to_string)
        .unwrap_or_else(|| dotted(&[DRIVER_MAJOR, DRIVER_MINOR, DRIVER_REV]));
    let cuda_version = get(CUDA_RUNTIME_FULL)
        .map(str::to_string)
        .unwrap_or_else(|| dotted(&[CUDA_RUNTIME_MAJOR, CUDA_RUNTIME_MINOR]));
    let flag = |key: &str| get(key).and_then(parse_bool).unwrap_or(false);

    DriverInfo {
        version,
        cuda_version,
        toolkit_installed: flag(TOOLKIT_INSTALLED),
        toolkit_ready: flag(TOOLKIT_READY),
    }
}

/// First eight hex digits of the SHA-256 of `raw`.
fn identity_digest(raw: &str) -> String {
    digest::digest(&digest::SHA256, raw.as_bytes())
        .as_ref()
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Sanitizes a string into a DNS-1123 subdomain name.
pub fn sanitize_name(raw: &str) -> String {
    let mapped: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut name = mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string();
    if name.len() > MAX_NAME_LEN {
        name.truncate(MAX_NAME_LEN);
        name = name.trim_end_matches(|c: char| !c.is_ascii_alphanumeric()).to_string();
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crds::{InstanceFeature, InstanceFeatureSet, NodeFeatureSpec};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new(Arc::new(StaticCatalog::new()))
    }

    fn feature_with_instances(
        node: &str,
        bulk: &[(&str, &str)],
        instances: Vec<BTreeMap<String, String>>,
    ) -> NodeFeature {
        let mut spec = NodeFeatureSpec {
            labels: labels(bulk),
            ..Default::default()
        };
        spec.features.instances.insert(
            GPU_INSTANCE_FEATURE.to_string(),
            InstanceFeatureSet {
                elements: instances
                    .into_iter()
                    .map(|attributes| InstanceFeature { attributes })
                    .collect(),
            },
        );
        NodeFeature::new(node, spec)
    }

    fn v100_labels() -> BTreeMap<String, String> {
        labels(&[
            ("gpu.dcops.microscaler.io/device.00.vendor", "10de"),
            ("gpu.dcops.microscaler.io/device.00.device", "1db5"),
            ("gpu.dcops.microscaler.io/device.00.class", "0302"),
        ])
    }

    #[test]
    fn test_label_only_device_with_catalog_product() {
        let snapshot = builder().build("gpu-node-1", &v100_labels(), None, &ManagedNodesPolicy::default());

        assert!(snapshot.managed);
        assert!(!snapshot.feature_source_detected);
        assert_eq!(snapshot.devices.len(), 1);
        let device = &snapshot.devices[0];
        assert_eq!(device.index, "0");
        assert_eq!(device.vendor, "10de");
        assert_eq!(device.device, "1db5");
        assert_eq!(device.class, "0302");
        assert_eq!(device.product, "Tesla V100-SXM2-32GB");
        assert_eq!(device.record_name("gpu-node-1"), "gpu-node-1-0-10de-1db5");
        assert_eq!(device.inventory_id("gpu-node-1"), "gpu-node-1/0");
        assert_eq!(device.labels.len(), 3);
    }

    #[test]
    fn test_malformed_and_foreign_devices_skipped() {
        let mut node_labels = v100_labels();
        node_labels.extend(labels(&[
            ("gpu.dcops.microscaler.io/device.1.vendor.extra", "10de"),
            ("gpu.dcops.microscaler.io/device.2.vendor", "1002"),
            ("gpu.dcops.microscaler.io/device.2.device", "740f"),
            ("gpu.dcops.microscaler.io/device.2.class", "0302"),
            ("gpu.dcops.microscaler.io/device.3.vendor", "10de"),
            ("gpu.dcops.microscaler.io/device.3.device", "20b0"),
            ("gpu.dcops.microscaler.io/device.0.color", "green"),
        ]));
        let snapshot = builder().build("n1", &node_labels, None, &ManagedNodesPolicy::default());

        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.devices[0].index, "0");
        assert_eq!(
            snapshot.devices[0].labels.get("gpu.dcops.microscaler.io/device.0.color").map(String::as_str),
            Some("green")
        );
    }

    #[test]
    fn test_uuid_duplicate_beats_pci_only() {
        let node_labels = labels(&[
            ("gpu.dcops.microscaler.io/device.0.vendor", "10de"),
            ("gpu.dcops.microscaler.io/device.0.device", "20b0"),
            ("gpu.dcops.microscaler.io/device.0.class", "0302"),
            ("gpu.dcops.microscaler.io/device.0.pciAddress", "0000:3b:00.0"),
            ("gpu.dcops.microscaler.io/device.1.vendor", "10de"),
            ("gpu.dcops.microscaler.io/device.1.device", "20b0"),
            ("gpu.dcops.microscaler.io/device.1.class", "0302"),
            ("gpu.dcops.microscaler.io/device.1.pciAddress", "3B:00.0"),
            ("gpu.dcops.microscaler.io/device.1.uuid", "GPU-abc"),
        ]);
        let snapshot = builder().build("n1", &node_labels, None, &ManagedNodesPolicy::default());

        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.devices[0].uuid, "GPU-abc");
        assert_eq!(snapshot.devices[0].index, "1");
    }

    #[test]
    fn test_node_labels_beat_feature_labels() {
        let mut node_labels = v100_labels();
        node_labels.insert("nvidia.com/gpu.product".to_string(), "From-Node".to_string());
        let feature = feature_with_instances(
            "n1",
            &[
                ("nvidia.com/gpu.product", "From-Feature"),
                ("nvidia.com/gpu.family", "volta"),
                ("pci-10de.present", "true"),
            ],
            vec![],
        );
        let snapshot = builder().build("n1", &node_labels, Some(&feature), &ManagedNodesPolicy::default());

        assert!(snapshot.feature_source_detected);
        assert_eq!(snapshot.labels.get("nvidia.com/gpu.product").map(String::as_str), Some("From-Node"));
        assert_eq!(
            snapshot.labels.get("feature.node.kubernetes.io/pci-10de.present").map(String::as_str),
            Some("true")
        );
        assert_eq!(snapshot.devices[0].product, "From-Node");
        assert_eq!(snapshot.devices[0].family, "volta");
    }

    #[test]
    fn test_instance_metrics_overwrite_descriptive_fill_only() {
        let mut node_labels = v100_labels();
        node_labels.insert("gpu.dcops.microscaler.io/device.0.product".to_string(), "Label-Product".to_string());
        node_labels.insert("gpu.dcops.microscaler.io/device.0.memoryMiB".to_string(), "16384".to_string());
        let feature = feature_with_instances(
            "n1",
            &[],
            vec![labels(&[
                ("index", "0"),
                ("product", "Instance-Product"),
                ("uuid", "GPU-1234"),
                ("memory.total", "32 GiB"),
                ("compute.major", "7"),
                ("compute.minor", "0"),
                ("precision", "fp32,fp16"),
                ("numa.node", "1"),
                ("power.limit", "300 W"),
                ("pcie.width", "x16"),
            ])],
        );
        let snapshot = builder().build("n1", &node_labels, Some(&feature), &ManagedNodesPolicy::default());

        let device = &snapshot.devices[0];
        assert_eq!(device.product, "Label-Product");
        assert_eq!(device.uuid, "GPU-1234");
        assert_eq!(device.memory_mib, 32768);
        assert_eq!((device.compute_major, device.compute_minor), (7, 0));
        assert_eq!(device.precisions, vec!["fp16".to_string(), "fp32".to_string()]);
        assert_eq!(device.numa_node, Some(1));
        assert_eq!(device.power_limit_watts, Some(300));
        assert_eq!(device.pcie_width, None);
        assert_eq!(device.sm_count, None);
    }

    #[test]
    fn test_instance_only_devices_sorted() {
        let feature = feature_with_instances(
            "n1",
            &[("nvidia.com/gpu.memory", "81920")],
            vec![
                labels(&[("index", "10"), ("vendor", "0x10de"), ("device", "20b2"), ("class", "0302")]),
                labels(&[("index", "2"), ("vendor", "10de"), ("device", "20b2"), ("class", "0302")]),
                labels(&[("index", "3"), ("vendor", "10de"), ("device", "20b2")]),
            ],
        );
        let snapshot = builder().build("n1", &BTreeMap::new(), Some(&feature), &ManagedNodesPolicy::default());

        let indices: Vec<&str> = snapshot.devices.iter().map(|d| d.index.as_str()).collect();
        assert_eq!(indices, vec!["2", "10"]);
        assert!(snapshot.devices.iter().all(|d| d.memory_mib == 81920));
        assert!(snapshot.devices.iter().all(|d| d.product == "A100-SXM4-80GB"));
    }

    #[test]
    fn test_node_mig_defaults_backfilled() {
        let mut node_labels = v100_labels();
        node_labels.insert("nvidia.com/mig.strategy".to_string(), "single".to_string());
        node_labels.insert("nvidia.com/mig-1g.10gb.count".to_string(), "7".to_string());
        let snapshot = builder().build("n1", &node_labels, None, &ManagedNodesPolicy::default());

        let mig = &snapshot.devices[0].mig;
        assert!(mig.capable);
        assert_eq!(mig.strategy, crds::MigStrategy::Single);
        assert_eq!(mig.capacities[0].count, 7);
    }

    #[test]
    fn test_managed_policy() {
        let policy = ManagedNodesPolicy::default();
        let mut node_labels = v100_labels();
        assert!(builder().build("n1", &node_labels, None, &policy).managed);

        node_labels.insert(DEFAULT_MANAGED_LABEL.to_string(), "FALSE".to_string());
        assert!(!builder().build("n1", &node_labels, None, &policy).managed);

        node_labels.insert(DEFAULT_MANAGED_LABEL.to_string(), "anything".to_string());
        assert!(builder().build("n1", &node_labels, None, &policy).managed);

        let opt_in = ManagedNodesPolicy {
            label_key: "example.com/gpu".to_string(),
            enabled_by_default: false,
        };
        assert!(!builder().build("n1", &v100_labels(), None, &opt_in).managed);
    }

    #[test]
    fn test_driver_info() {
        let node_labels = labels(&[
            ("nvidia.com/cuda.driver.major", "535"),
            ("nvidia.com/cuda.driver.minor", "104"),
            ("nvidia.com/cuda.driver.rev", "05"),
            ("nvidia.com/cuda.runtime-version.full", "12.2"),
            ("gpu.dcops.microscaler.io/toolkit.installed", "true"),
        ]);
        let snapshot = builder().build("n1", &node_labels, None, &ManagedNodesPolicy::default());

        assert_eq!(snapshot.driver.version, "535.104.05");
        assert_eq!(snapshot.driver.cuda_version, "12.2");
        assert!(snapshot.driver.toolkit_installed);
        assert!(!snapshot.driver.toolkit_ready);
        assert!(snapshot.devices.is_empty());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Node_A-01-10de-1db5"), "node-a-01-10de-1db5");
        assert_eq!(sanitize_name("-x-"), "x");
    }

    #[test]
    fn test_record_name_keeps_distinct_raw_indices_apart() {
        let device = |index: &str| DeviceSnapshot {
            index: index.to_string(),
            vendor: "10de".to_string(),
            device: "1db5".to_string(),
            ..Default::default()
        };
        let upper = device("A_1").record_name("gpu-1");
        let lower = device("a-1").record_name("gpu-1");

        assert_eq!(lower, "gpu-1-a-1-10de-1db5");
        assert_ne!(upper, lower);
        assert!(upper.starts_with("gpu-1-a-1-10de-1db5-"));
        assert_eq!(upper.len(), lower.len() + 9);
        assert_eq!(upper, device("A_1").record_name("gpu-1"));
    }
}
