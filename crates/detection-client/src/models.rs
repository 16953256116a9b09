//! Detection payload models

use serde::{Deserialize, Serialize};

/// Detection payload of one node
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeDetection {
    /// One entry per GPU the agent sees
    #[serde(default)]
    pub devices: Vec<DeviceDetection>,
}

/// Live readings of one device
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceDetection {
    /// Device index as reported by the agent
    pub index: String,
    /// Device UUID
    pub uuid: String,
    /// PCI bus address
    pub pci_address: String,
    /// Core temperature in Celsius
    pub temperature_celsius: Option<i32>,
    /// Current power draw in watts
    pub power_usage_watts: Option<i32>,
    /// GPU utilization percent
    pub utilization_percent: Option<i32>,
    /// Device memory in use
    #[serde(rename = "memoryUsedMiB")]
    pub memory_used_mib: Option<i64>,
    /// MIG mode as reported by the agent (`enabled` / `disabled`)
    pub mig_mode: Option<String>,
    /// MIG instances currently configured
    pub mig_profiles: Vec<String>,
}

impl DeviceDetection {
    /// MIG mode as a flag; `None` when the agent did not report it or the
    /// value is not understood.
    pub fn mig_enabled(&self) -> Option<bool> {
        let mode = self.mig_mode.as_deref()?.trim().to_ascii_lowercase();
        match mode.as_str() {
            "enabled" | "true" | "on" => Some(true),
            "disabled" | "false" | "off" => Some(false),
            _ => None,
        }
    }
}

/// Index canonicalization, kept in step with `gpu_discovery::parse::canonical_index`.
///
/// This crate stays free of the CRD and kube stack that `gpu-discovery`
/// pulls in, so the rule is repeated here; the inventory controller pins the
/// two together in its tests.
fn trim_index(index: &str) -> &str {
    let index = index.trim();
    if index.bytes().all(|b| b.is_ascii_digit()) {
        let stripped = index.trim_start_matches('0');
        if stripped.is_empty() { "0" } else { stripped }
    } else {
        index
    }
}

impl NodeDetection {
    /// Finds the readings for a device, by UUID first and then by index.
    pub fn find_device(&self, uuid: &str, index: &str) -> Option<&DeviceDetection> {
        if !uuid.is_empty() {
            if let Some(device) = self
                .devices
                .iter()
                .find(|d| !d.uuid.is_empty() && d.uuid.eq_ignore_ascii_case(uuid))
            {
                return Some(device);
            }
        }
        let index = trim_index(index);
        self.devices.iter().find(|d| trim_index(&d.index) == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> NodeDetection {
        serde_json::from_str(
            r#"{"devices":[
                {"index":"0","uuid":"GPU-AAA","temperatureCelsius":41,"memoryUsedMiB":1024,"migMode":"Enabled"},
                {"index":"01","uuid":"GPU-BBB","powerUsageWatts":250}
            ]}"#,
        )
        .expect("payload")
    }

    #[test]
    fn test_lookup_prefers_uuid() {
        let detection = payload();
        let device = detection.find_device("gpu-bbb", "0").expect("device");
        assert_eq!(device.power_usage_watts, Some(250));
    }

    #[test]
    fn test_lookup_falls_back_to_index() {
        let detection = payload();
        let device = detection.find_device("GPU-ZZZ", "1").expect("device");
        assert_eq!(device.uuid, "GPU-BBB");
        assert!(detection.find_device("", "7").is_none());
    }

    #[test]
    fn test_mig_mode() {
        let detection = payload();
        assert_eq!(detection.devices[0].mig_enabled(), Some(true));
        assert_eq!(detection.devices[0].memory_used_mib, Some(1024));
        assert_eq!(detection.devices[1].mig_enabled(), None);
    }
}
