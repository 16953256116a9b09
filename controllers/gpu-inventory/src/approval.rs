//! Device approval policy.
//!
//! Decides whether a discovered device may be handed to workloads without an
//! operator approving it first. The policy is built once from configuration
//! and never changes afterwards; an unparsable selector is a hard error so
//! the controller refuses to start instead of silently granting or denying
//! every device.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use gpu_discovery::DeviceSnapshot;
use kube::core::{Expression, Selector, SelectorExt};
use thiserror::Error;

/// Prefix of the labels synthesized from a device snapshot
const DEVICE_LABEL_PREFIX: &str = "gpu.dcops.microscaler.io/";

/// Errors raised while building a policy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalPolicyError {
    /// Unknown approval mode
    #[error("unknown device approval mode {0:?} (expected manual, automatic or selector)")]
    InvalidMode(String),

    /// Selector expression could not be compiled
    #[error("invalid device approval selector {expression:?}: {reason}")]
    InvalidSelector { expression: String, reason: String },
}

/// Approval mode as configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalMode {
    /// Every device waits for an operator
    #[default]
    Manual,
    /// Every device on a managed node is attached
    Automatic,
    /// Devices matching a label selector are attached
    Selector,
}

impl FromStr for ApprovalMode {
    type Err = ApprovalPolicyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "manual" => Ok(ApprovalMode::Manual),
            "automatic" | "auto" => Ok(ApprovalMode::Automatic),
            "selector" => Ok(ApprovalMode::Selector),
            other => Err(ApprovalPolicyError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalMode::Manual => write!(f, "manual"),
            ApprovalMode::Automatic => write!(f, "automatic"),
            ApprovalMode::Selector => write!(f, "selector"),
        }
    }
}

/// Compiled device approval policy
#[derive(Debug, Clone, Default)]
pub enum DeviceApprovalPolicy {
    /// Every device waits for an explicit approval
    #[default]
    Manual,
    /// Every discovered device is approved
    Automatic,
    /// `None` matches every device
    Selector(Option<Selector>),
}

impl DeviceApprovalPolicy {
    /// Builds a policy. The selector is only consulted in selector mode.
    pub fn new(mode: ApprovalMode, selector: Option<&str>) -> Result<Self, ApprovalPolicyError> {
        match mode {
            ApprovalMode::Manual => Ok(DeviceApprovalPolicy::Manual),
            ApprovalMode::Automatic => Ok(DeviceApprovalPolicy::Automatic),
            ApprovalMode::Selector => {
                let selector = match selector.map(str::trim) {
                    None | Some("") => None,
                    Some(expression) => Some(parse_selector(expression)?),
                };
                Ok(DeviceApprovalPolicy::Selector(selector))
            }
        }
    }

    /// Mode this policy was compiled from.
    pub fn mode(&self) -> ApprovalMode {
        match self {
            DeviceApprovalPolicy::Manual => ApprovalMode::Manual,
            DeviceApprovalPolicy::Automatic => ApprovalMode::Automatic,
            DeviceApprovalPolicy::Selector(_) => ApprovalMode::Selector,
        }
    }

    /// Whether a device may be attached without operator approval.
    ///
    /// Devices on unmanaged nodes are never attached.
    pub fn auto_attach(&self, managed: bool, device_labels: &BTreeMap<String, String>) -> bool {
        if !managed {
            return false;
        }
        match self {
            DeviceApprovalPolicy::Manual => false,
            DeviceApprovalPolicy::Automatic => true,
            DeviceApprovalPolicy::Selector(None) => true,
            DeviceApprovalPolicy::Selector(Some(selector)) => selector.matches(device_labels),
        }
    }

    /// Label set a selector is evaluated against: synthesized hardware labels
    /// plus the raw per-index labels of the device.
    pub fn device_labels(device: &DeviceSnapshot) -> BTreeMap<String, String> {
        let mut labels = device.labels.clone();
        let mut put = |field: &str, value: String| {
            if !value.is_empty() {
                labels.insert(format!("{DEVICE_LABEL_PREFIX}{field}"), value);
            }
        };

        put("vendor", device.vendor.clone());
        put("device", device.device.clone());
        put("class", device.class.clone());
        put("product", sanitize_label_value(&device.product));
        put("uuid", device.uuid.clone());
        if device.memory_mib > 0 {
            put("memoryMiB", device.memory_mib.to_string());
        }
        put("mig.capable", device.mig.capable.to_string());
        put("mig.strategy", device.mig.strategy.as_str().to_string());
        labels
    }
}

/// Product names contain spaces; label values may not.
fn sanitize_label_value(value: &str) -> String {
    let mapped: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .chars()
        .take(63)
        .collect()
}

/// Parses a label selector expression (`k`, `!k`, `k=v`, `k==v`, `k!=v`,
/// `k in (a,b)`, `k notin (a,b)`, comma separated).
pub fn parse_selector(expression: &str) -> Result<Selector, ApprovalPolicyError> {
    let invalid = |reason: String| ApprovalPolicyError::InvalidSelector {
        expression: expression.to_string(),
        reason,
    };

    let mut expressions = Vec::new();
    for requirement in split_requirements(expression).map_err(invalid)? {
        expressions.push(parse_requirement(&requirement).map_err(invalid)?);
    }
    Ok(expressions.into_iter().collect())
}

/// Splits on commas outside parentheses.
fn split_requirements(expression: &str) -> Result<Vec<String>, String> {
    let mut requirements = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in expression.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced ')'".to_string())?;
                current.push(c);
            }
            ',' if depth == 0 => requirements.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err("unbalanced '('".to_string());
    }
    requirements.push(current);

    let requirements: Vec<String> = requirements
        .into_iter()
        .map(|r| r.trim().to_string())
        .collect();
    if requirements.iter().any(String::is_empty) {
        return Err("empty requirement".to_string());
    }
    Ok(requirements)
}

fn parse_requirement(requirement: &str) -> Result<Expression, String> {
    if let Some(key) = requirement.strip_prefix('!') {
        let key = key.trim();
        validate_key(key)?;
        return Ok(Expression::DoesNotExist(key.to_string()));
    }

    if let Some(open) = requirement.find('(') {
        let inner = requirement[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| format!("{requirement:?}: value list must end with ')'"))?;
        let head: Vec<&str> = requirement[..open].split_whitespace().collect();
        let [key, operator] = head.as_slice() else {
            return Err(format!("{requirement:?}: expected '<key> in|notin (...)'"));
        };
        validate_key(key)?;
        let values = inner
            .split(',')
            .map(str::trim)
            .map(|v| validate_value(v).map(|()| v.to_string()))
            .collect::<Result<BTreeSet<String>, String>>()?;
        if values.is_empty() {
            return Err(format!("{requirement:?}: empty value list"));
        }
        return match *operator {
            "in" => Ok(Expression::In((*key).to_string(), values)),
            "notin" => Ok(Expression::NotIn((*key).to_string(), values)),
            other => Err(format!("{requirement:?}: unknown operator {other:?}")),
        };
    }

    let (key, value, negated) = if let Some((k, v)) = requirement.split_once("!=") {
        (k, v, true)
    } else if let Some((k, v)) = requirement.split_once("==") {
        (k, v, false)
    } else if let Some((k, v)) = requirement.split_once('=') {
        (k, v, false)
    } else {
        let key = requirement.trim();
        validate_key(key)?;
        return Ok(Expression::Exists(key.to_string()));
    };

    let (key, value) = (key.trim(), value.trim());
    validate_key(key)?;
    validate_value(value)?;
    if negated {
        Ok(Expression::NotEqual(key.to_string(), value.to_string()))
    } else {
        Ok(Expression::Equal(key.to_string(), value.to_string()))
    }
}

/// `[prefix/]name` with a DNS subdomain prefix and a 63 character name.
fn validate_key(key: &str) -> Result<(), String> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        let valid_prefix = !prefix.is_empty()
            && prefix.len() <= 253
            && prefix.split('.').all(|part| {
                !part.is_empty()
                    && part.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
                    && !part.starts_with('-')
                    && !part.ends_with('-')
            });
        if !valid_prefix {
            return Err(format!("invalid label key prefix {prefix:?}"));
        }
    }
    if name.is_empty() || !is_label_token(name) {
        return Err(format!("invalid label key {key:?}"));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<(), String> {
    if value.is_empty() || is_label_token(value) {
        Ok(())
    } else {
        Err(format!("invalid label value {value:?}"))
    }
}

fn is_label_token(token: &str) -> bool {
    let bytes = token.as_bytes();
    token.len() <= 63
        && bytes.first().is_some_and(u8::is_ascii_alphanumeric)
        && bytes.last().is_some_and(u8::is_ascii_alphanumeric)
        && bytes
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn a100() -> DeviceSnapshot {
        DeviceSnapshot {
            index: "0".to_string(),
            vendor: "10de".to_string(),
            device: "20b0".to_string(),
            class: "0302".to_string(),
            product: "NVIDIA A100-SXM4-40GB".to_string(),
            memory_mib: 40960,
            uuid: "GPU-1".to_string(),
            labels: labels(&[("gpu.dcops.microscaler.io/device.0.rack", "r12")]),
            ..Default::default()
        }
    }

    #[test]
    fn test_manual_never_attaches() {
        let policy = DeviceApprovalPolicy::new(ApprovalMode::Manual, Some("ignored")).expect("policy");
        assert!(!policy.auto_attach(true, &BTreeMap::new()));
        assert!(!policy.auto_attach(false, &BTreeMap::new()));
    }

    #[test]
    fn test_automatic_attaches_only_when_managed() {
        let policy = DeviceApprovalPolicy::new(ApprovalMode::Automatic, None).expect("policy");
        assert!(policy.auto_attach(true, &BTreeMap::new()));
        assert!(!policy.auto_attach(false, &BTreeMap::new()));
    }

    #[test]
    fn test_selector_matches_device_labels() {
        let policy = DeviceApprovalPolicy::new(
            ApprovalMode::Selector,
            Some("gpu.dcops.microscaler.io/device in (20b0, 20b2), gpu.dcops.microscaler.io/mig.capable!=true"),
        )
        .expect("policy");
        let device_labels = DeviceApprovalPolicy::device_labels(&a100());

        assert!(policy.auto_attach(true, &device_labels));
        assert!(!policy.auto_attach(false, &device_labels));

        let mut other = a100();
        other.device = "1db5".to_string();
        assert!(!policy.auto_attach(true, &DeviceApprovalPolicy::device_labels(&other)));
    }

    #[test]
    fn test_selector_on_raw_labels_and_existence() {
        let policy = DeviceApprovalPolicy::new(
            ApprovalMode::Selector,
            Some("gpu.dcops.microscaler.io/device.0.rack=r12,gpu.dcops.microscaler.io/uuid,!example.com/quarantine"),
        )
        .expect("policy");
        let mut device_labels = DeviceApprovalPolicy::device_labels(&a100());
        assert!(policy.auto_attach(true, &device_labels));

        device_labels.insert("example.com/quarantine".to_string(), "yes".to_string());
        assert!(!policy.auto_attach(true, &device_labels));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let policy = DeviceApprovalPolicy::new(ApprovalMode::Selector, Some("  ")).expect("policy");
        assert!(matches!(policy, DeviceApprovalPolicy::Selector(None)));
        assert!(policy.auto_attach(true, &BTreeMap::new()));
        assert!(!policy.auto_attach(false, &BTreeMap::new()));
    }

    #[test]
    fn test_invalid_selector_fails_construction() {
        for expression in ["a in (b", "a,,b", "bad key=v", "a=b c", "a notanop (x)", "-a=b"] {
            let result = DeviceApprovalPolicy::new(ApprovalMode::Selector, Some(expression));
            assert!(
                matches!(result, Err(ApprovalPolicyError::InvalidSelector { .. })),
                "expected {expression:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_device_labels_synthesized() {
        let device_labels = DeviceApprovalPolicy::device_labels(&a100());
        assert_eq!(device_labels.get("gpu.dcops.microscaler.io/vendor").map(String::as_str), Some("10de"));
        assert_eq!(
            device_labels.get("gpu.dcops.microscaler.io/product").map(String::as_str),
            Some("NVIDIA-A100-SXM4-40GB")
        );
        assert_eq!(device_labels.get("gpu.dcops.microscaler.io/memoryMiB").map(String::as_str), Some("40960"));
        assert_eq!(device_labels.get("gpu.dcops.microscaler.io/mig.capable").map(String::as_str), Some("false"));
        assert_eq!(device_labels.get("gpu.dcops.microscaler.io/mig.strategy").map(String::as_str), Some("none"));
        assert!(device_labels.contains_key("gpu.dcops.microscaler.io/device.0.rack"));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Automatic".parse::<ApprovalMode>(), Ok(ApprovalMode::Automatic));
        assert_eq!("".parse::<ApprovalMode>(), Ok(ApprovalMode::Manual));
        assert!(matches!("always".parse::<ApprovalMode>(), Err(ApprovalPolicyError::InvalidMode(_))));
    }
}
