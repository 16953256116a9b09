//! Hardware catalog lookup
//!
//! Last-resort source of product names for devices whose labels and
//! NodeFeature attributes carry none.

use std::collections::HashMap;

/// Trait for resolving PCI vendor/device ids to a product name
pub trait HardwareCatalog: Send + Sync {
    /// Returns the product name for the given lower-case hex ids.
    fn product_name(&self, vendor: &str, device: &str) -> Option<String>;
}

/// Built-in table of NVIDIA data-centre parts
const NVIDIA_PRODUCTS: &[(&str, &str)] = &[
    ("1db1", "Tesla V100-SXM2-16GB"),
    ("1db4", "Tesla V100-PCIE-16GB"),
    ("1db5", "Tesla V100-SXM2-32GB"),
    ("1db6", "Tesla V100-PCIE-32GB"),
    ("1eb8", "Tesla T4"),
    ("20b0", "A100-SXM4-40GB"),
    ("20b2", "A100-SXM4-80GB"),
    ("20b5", "A100 80GB PCIe"),
    ("20f1", "A100-PCIE-40GB"),
    ("2235", "A40"),
    ("2236", "A10"),
    ("25b6", "A16"),
    ("26b5", "L40"),
    ("26b9", "L40S"),
    ("27b8", "L4"),
    ("2330", "H100 SXM5 80GB"),
    ("2331", "H100 PCIe"),
    ("2335", "H200"),
];

/// In-memory catalog seeded with the built-in table
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    entries: HashMap<(String, String), String>,
}

impl StaticCatalog {
    /// Creates a catalog containing the built-in NVIDIA table.
    pub fn new() -> Self {
        let entries = NVIDIA_PRODUCTS
            .iter()
            .map(|(device, name)| {
                (
                    (crate::labels::NVIDIA_VENDOR_ID.to_string(), (*device).to_string()),
                    (*name).to_string(),
                )
            })
            .collect();
        Self { entries }
    }

    /// Creates a catalog with no entries.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Adds or replaces an entry.
    #[must_use]
    pub fn with_entry(mut self, vendor: &str, device: &str, name: &str) -> Self {
        self.entries.insert(
            (vendor.to_ascii_lowercase(), device.to_ascii_lowercase()),
            name.to_string(),
        );
        self
    }
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareCatalog for StaticCatalog {
    fn product_name(&self, vendor: &str, device: &str) -> Option<String> {
        self.entries
            .get(&(vendor.to_ascii_lowercase(), device.to_ascii_lowercase()))
            .cloned()
    }
}
