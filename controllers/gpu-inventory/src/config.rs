//! Controller configuration.
//!
//! Static settings come from environment variables. The managed-node and
//! device approval settings can additionally be overridden at runtime through
//! a ConfigMap, which is re-read on every reconcile.

use std::collections::BTreeMap;
use std::time::Duration;

use gpu_discovery::ManagedNodesPolicy;
use gpu_discovery::parse::parse_bool;

use crate::approval::{ApprovalMode, DeviceApprovalPolicy};
use crate::error::ControllerError;

const DEFAULT_CONTROLLER_NAME: &str = "gpu-inventory-controller";
const DEFAULT_RESYNC_SECS: u64 = 300;
const DEFAULT_DETECTION_TIMEOUT_SECS: u64 = 5;
const DEFAULT_CONCURRENCY: u16 = 4;
const DEFAULT_ERROR_BACKOFF_MIN_SECS: u64 = 5;
const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 300;

/// ConfigMap keys of the runtime policy overrides
pub const KEY_MANAGED_LABEL: &str = "managedNodes.labelKey";
/// Policy ConfigMap keys
pub const KEY_MANAGED_DEFAULT: &str = "managedNodes.enabledByDefault";
pub const KEY_APPROVAL_MODE: &str = "deviceApproval.mode";
pub const KEY_APPROVAL_SELECTOR: &str = "deviceApproval.selector";

/// Location of the policy ConfigMap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfigRef {
    /// Namespace holding the ConfigMap
    pub namespace: String,
    /// ConfigMap name
    pub name: String,
}

/// Static controller configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Opt-in/opt-out rule for GPU nodes
    pub managed_nodes: ManagedNodesPolicy,
    /// How discovered devices are approved
    pub approval_mode: ApprovalMode,
    /// Label selector used when `approval_mode` is `Selector`
    pub approval_selector: Option<String>,
    /// Namespace NodeFeature objects are read from; `None` = all namespaces
    pub node_feature_namespace: Option<String>,
    /// Runtime policy overrides, re-read every round
    pub policy_config: Option<PolicyConfigRef>,
    /// Requeue delay for settled nodes
    pub resync_interval: Duration,
    /// Port of the per-node detection agent; `None` disables detection
    pub detection_port: Option<u16>,
    /// Budget for one detection agent request
    pub detection_timeout: Duration,
    /// Nodes reconciled in parallel
    pub concurrency: u16,
    /// First retry delay after a failed node round
    pub error_backoff_min: Duration,
    /// Cap on the retry delay after repeated failures
    pub error_backoff_max: Duration,
    /// Reporting controller name on published events
    pub controller_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            managed_nodes: ManagedNodesPolicy::default(),
            approval_mode: ApprovalMode::Manual,
            approval_selector: None,
            node_feature_namespace: None,
            policy_config: None,
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_SECS),
            detection_port: None,
            detection_timeout: Duration::from_secs(DEFAULT_DETECTION_TIMEOUT_SECS),
            concurrency: DEFAULT_CONCURRENCY,
            error_backoff_min: Duration::from_secs(DEFAULT_ERROR_BACKOFF_MIN_SECS),
            error_backoff_max: Duration::from_secs(DEFAULT_ERROR_BACKOFF_MAX_SECS),
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let managed_nodes = ManagedNodesPolicy {
            label_key: get("MANAGED_NODE_LABEL").unwrap_or(defaults.managed_nodes.label_key),
            enabled_by_default: match get("MANAGED_NODES_ENABLED_BY_DEFAULT") {
                Some(value) => parse_bool(&value).ok_or_else(|| {
                    ControllerError::InvalidConfig(format!(
                        "MANAGED_NODES_ENABLED_BY_DEFAULT must be a boolean, got {value:?}"
                    ))
                })?,
                None => defaults.managed_nodes.enabled_by_default,
            },
        };

        let approval_mode = match get("DEVICE_APPROVAL_MODE") {
            Some(value) => value.parse()?,
            None => defaults.approval_mode,
        };

        let policy_config = get("POLICY_CONFIGMAP_NAME").map(|name| PolicyConfigRef {
            namespace: get("POLICY_CONFIGMAP_NAMESPACE")
                .or_else(|| get("POD_NAMESPACE"))
                .unwrap_or_else(|| "default".to_string()),
            name,
        });

        let detection_port = get("DETECTION_PORT")
            .map(|value| parse_number::<u16>("DETECTION_PORT", &value))
            .transpose()?;

        let error_backoff_min = seconds(&get, "ERROR_BACKOFF_MIN_SECS", DEFAULT_ERROR_BACKOFF_MIN_SECS)?;
        let error_backoff_max = seconds(&get, "ERROR_BACKOFF_MAX_SECS", DEFAULT_ERROR_BACKOFF_MAX_SECS)?;
        if error_backoff_min.is_zero() || error_backoff_max < error_backoff_min {
            return Err(ControllerError::InvalidConfig(format!(
                "error backoff bounds must satisfy 0 < ERROR_BACKOFF_MIN_SECS <= ERROR_BACKOFF_MAX_SECS, got {}s and {}s",
                error_backoff_min.as_secs(),
                error_backoff_max.as_secs()
            )));
        }

        Ok(Self {
            managed_nodes,
            approval_mode,
            approval_selector: get("DEVICE_APPROVAL_SELECTOR"),
            node_feature_namespace: get("NODE_FEATURE_NAMESPACE"),
            policy_config,
            resync_interval: seconds(&get, "RESYNC_INTERVAL_SECS", DEFAULT_RESYNC_SECS)?,
            detection_port,
            detection_timeout: seconds(&get, "DETECTION_TIMEOUT_SECS", DEFAULT_DETECTION_TIMEOUT_SECS)?,
            concurrency: match get("RECONCILE_CONCURRENCY") {
                Some(value) => parse_number::<u16>("RECONCILE_CONCURRENCY", &value)?.max(1),
                None => DEFAULT_CONCURRENCY,
            },
            error_backoff_min,
            error_backoff_max,
            controller_name: get("CONTROLLER_NAME").unwrap_or(defaults.controller_name),
        })
    }

    /// Policy in effect when no runtime override is available.
    ///
    /// Fails when the configured selector does not compile.
    pub fn static_policy(&self) -> Result<EffectivePolicy, ControllerError> {
        EffectivePolicy::new(
            self.managed_nodes.clone(),
            self.approval_mode,
            self.approval_selector.clone(),
        )
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ControllerError> {
    value
        .parse()
        .map_err(|_| ControllerError::InvalidConfig(format!("{key} must be a non-negative integer, got {value:?}")))
}

fn seconds(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration, ControllerError> {
    match get(key) {
        Some(value) => parse_number::<u64>(key, &value).map(Duration::from_secs),
        None => Ok(Duration::from_secs(default)),
    }
}

/// Managed-node and approval policy used for one reconcile
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    /// Which nodes the controller manages
    pub managed_nodes: ManagedNodesPolicy,
    /// Compiled device approval rule
    pub approval: DeviceApprovalPolicy,
    approval_selector: Option<String>,
}

impl EffectivePolicy {
    /// Compiles a policy, rejecting an invalid approval selector.
    pub fn new(
        managed_nodes: ManagedNodesPolicy,
        mode: ApprovalMode,
        selector: Option<String>,
    ) -> Result<Self, ControllerError> {
        let approval = DeviceApprovalPolicy::new(mode, selector.as_deref())?;
        Ok(Self {
            managed_nodes,
            approval,
            approval_selector: selector,
        })
    }

    /// Applies the keys present in a policy ConfigMap on top of this policy.
    pub fn with_overrides(&self, data: &BTreeMap<String, String>) -> Result<Self, ControllerError> {
        let get = |key: &str| data.get(key).map(|value| value.trim().to_string());

        let mut managed_nodes = self.managed_nodes.clone();
        if let Some(label_key) = get(KEY_MANAGED_LABEL).filter(|k| !k.is_empty()) {
            managed_nodes.label_key = label_key;
        }
        if let Some(value) = get(KEY_MANAGED_DEFAULT) {
            managed_nodes.enabled_by_default = parse_bool(&value).ok_or_else(|| {
                ControllerError::InvalidConfig(format!("{KEY_MANAGED_DEFAULT} must be a boolean, got {value:?}"))
            })?;
        }

        let mode = match get(KEY_APPROVAL_MODE) {
            Some(value) => value.parse()?,
            None => self.approval.mode(),
        };
        let selector = get(KEY_APPROVAL_SELECTOR).or_else(|| self.approval_selector.clone());

        Self::new(managed_nodes, mode, selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalPolicyError;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.managed_nodes.label_key, "gpu.dcops.microscaler.io/enabled");
        assert!(config.managed_nodes.enabled_by_default);
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert!(config.detection_port.is_none());
        assert!(config.policy_config.is_none());
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("MANAGED_NODE_LABEL", "example.com/gpu-managed"),
            ("MANAGED_NODES_ENABLED_BY_DEFAULT", "no"),
            ("DEVICE_APPROVAL_MODE", "selector"),
            ("DEVICE_APPROVAL_SELECTOR", "gpu.dcops.microscaler.io/vendor=10de"),
            ("POLICY_CONFIGMAP_NAME", "gpu-policy"),
            ("POD_NAMESPACE", "dcops-system"),
            ("RESYNC_INTERVAL_SECS", "60"),
            ("DETECTION_PORT", "9400"),
            ("RECONCILE_CONCURRENCY", "0"),
        ]))
        .expect("config");

        assert_eq!(config.managed_nodes.label_key, "example.com/gpu-managed");
        assert!(!config.managed_nodes.enabled_by_default);
        assert_eq!(config.approval_mode, ApprovalMode::Selector);
        assert_eq!(
            config.policy_config,
            Some(PolicyConfigRef {
                namespace: "dcops-system".to_string(),
                name: "gpu-policy".to_string()
            })
        );
        assert_eq!(config.resync_interval, Duration::from_secs(60));
        assert_eq!(config.detection_port, Some(9400));
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn test_error_backoff_bounds() {
        let defaults = ControllerConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(defaults.error_backoff_min, Duration::from_secs(5));
        assert_eq!(defaults.error_backoff_max, Duration::from_secs(300));

        let tuned = ControllerConfig::from_lookup(lookup(&[
            ("ERROR_BACKOFF_MIN_SECS", "2"),
            ("ERROR_BACKOFF_MAX_SECS", "30"),
        ]))
        .expect("config");
        assert_eq!(tuned.error_backoff_min, Duration::from_secs(2));
        assert_eq!(tuned.error_backoff_max, Duration::from_secs(30));

        const ZERO_FLOOR: &[(&str, &str)] = &[("ERROR_BACKOFF_MIN_SECS", "0")];
        const INVERTED: &[(&str, &str)] = &[("ERROR_BACKOFF_MIN_SECS", "60"), ("ERROR_BACKOFF_MAX_SECS", "10")];
        for pairs in [ZERO_FLOOR, INVERTED] {
            assert!(matches!(
                ControllerConfig::from_lookup(lookup(pairs)),
                Err(ControllerError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ControllerConfig::from_lookup(lookup(&[("RESYNC_INTERVAL_SECS", "soon")])),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            ControllerConfig::from_lookup(lookup(&[("DEVICE_APPROVAL_MODE", "yolo")])),
            Err(ControllerError::ApprovalPolicy(ApprovalPolicyError::InvalidMode(_)))
        ));
    }

    #[test]
    fn test_invalid_selector_fails_static_policy() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("DEVICE_APPROVAL_MODE", "selector"),
            ("DEVICE_APPROVAL_SELECTOR", "vendor in (10de"),
        ]))
        .expect("config");
        assert!(matches!(
            config.static_policy(),
            Err(ControllerError::ApprovalPolicy(ApprovalPolicyError::InvalidSelector { .. }))
        ));
    }

    #[test]
    fn test_policy_overrides() {
        let base = ControllerConfig::default().static_policy().expect("policy");
        let data: BTreeMap<String, String> = [
            (KEY_MANAGED_LABEL, "example.com/managed"),
            (KEY_APPROVAL_MODE, "automatic"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let effective = base.with_overrides(&data).expect("overrides");
        assert_eq!(effective.managed_nodes.label_key, "example.com/managed");
        assert!(effective.managed_nodes.enabled_by_default);
        assert_eq!(effective.approval.mode(), ApprovalMode::Automatic);

        let bad: BTreeMap<String, String> = [(KEY_APPROVAL_MODE.to_string(), "selector".to_string()), (
            KEY_APPROVAL_SELECTOR.to_string(),
            "a in (".to_string(),
        )]
        .into_iter()
        .collect();
        assert!(base.with_overrides(&bad).is_err());
    }
}
