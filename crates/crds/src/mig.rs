//! Multi-Instance-GPU types shared by device status and the snapshot builder.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// MIG partitioning strategy advertised for a node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MigStrategy {
    /// MIG is not in use
    #[default]
    None,
    /// All GPUs on the node use one profile
    Single,
    /// GPUs may use different profiles
    Mixed,
}

impl MigStrategy {
    /// Parses a strategy label value; anything unrecognized is `None`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" => MigStrategy::Single,
            "mixed" => MigStrategy::Mixed,
            _ => MigStrategy::None,
        }
    }

    /// Label spelling of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigStrategy::None => "none",
            MigStrategy::Single => "single",
            MigStrategy::Mixed => "mixed",
        }
    }
}

/// Capacity advertised for one MIG profile
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MigProfileCapacity {
    /// Profile name, e.g. `mig-1g.10gb`
    pub profile: String,
    /// Number of instances of this profile
    pub count: i32,
    /// Memory per instance
    #[serde(rename = "memoryMiB")]
    pub memory_mib: i64,
    /// Streaming multiprocessors per instance
    pub multiprocessors: i32,
    /// Copy engines per instance
    pub copy_engines: i32,
    /// Video decoders per instance
    pub decoders: i32,
    /// Video encoders per instance
    pub encoders: i32,
    /// JPEG decoders per instance
    pub jpeg_engines: i32,
    /// Optical flow accelerators per instance
    pub ofa_engines: i32,
}

/// MIG capability of a device
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MigCapability {
    /// Device supports MIG partitioning
    pub capable: bool,
    /// Strategy advertised for the node
    pub strategy: MigStrategy,
    /// Supported profile names, sorted
    pub profiles: Vec<String>,
    /// Per-profile capacities, sorted by profile name
    pub capacities: Vec<MigProfileCapacity>,
}

impl MigCapability {
    /// True when nothing at all is known about MIG for the device.
    pub fn is_empty(&self) -> bool {
        !self.capable
            && self.strategy == MigStrategy::None
            && self.profiles.is_empty()
            && self.capacities.is_empty()
    }
}
