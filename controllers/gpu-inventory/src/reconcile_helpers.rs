//! Helper functions for common reconciliation patterns
//!
//! Status blocks are never overwritten wholesale. Every field is compared
//! before it is assigned, and the callers write only when at least one
//! comparison reported a change, so a no-op reconcile performs zero writes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crds::{GpuHardware, GpuHealth, InventoryCondition};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::error::ControllerError;
use crate::store::MetadataPatch;

/// Assigns `value` to `field` if they differ; reports whether it did.
pub fn set_field<T: PartialEq>(field: &mut T, value: T) -> bool {
    if *field == value {
        false
    } else {
        *field = value;
        true
    }
}

/// Brings `current` in line with `desired` one field at a time.
pub fn update_hardware(current: &mut GpuHardware, desired: GpuHardware) -> bool {
    let GpuHardware {
        index,
        vendor,
        device,
        class,
        pci_address,
        product,
        memory_mib,
        compute_major,
        compute_minor,
        uuid,
        precisions,
        numa_node,
        power_limit_watts,
        sm_count,
        memory_bandwidth_mbps,
        pcie_generation,
        pcie_width,
        board,
        family,
        serial,
        pstate,
        display_mode,
        mig,
    } = desired;

    let mut changed = false;
    changed |= set_field(&mut current.index, index);
    changed |= set_field(&mut current.vendor, vendor);
    changed |= set_field(&mut current.device, device);
    changed |= set_field(&mut current.class, class);
    changed |= set_field(&mut current.pci_address, pci_address);
    changed |= set_field(&mut current.product, product);
    changed |= set_field(&mut current.memory_mib, memory_mib);
    changed |= set_field(&mut current.compute_major, compute_major);
    changed |= set_field(&mut current.compute_minor, compute_minor);
    changed |= set_field(&mut current.uuid, uuid);
    changed |= set_field(&mut current.precisions, precisions);
    changed |= set_field(&mut current.numa_node, numa_node);
    changed |= set_field(&mut current.power_limit_watts, power_limit_watts);
    changed |= set_field(&mut current.sm_count, sm_count);
    changed |= set_field(&mut current.memory_bandwidth_mbps, memory_bandwidth_mbps);
    changed |= set_field(&mut current.pcie_generation, pcie_generation);
    changed |= set_field(&mut current.pcie_width, pcie_width);
    changed |= set_field(&mut current.board, board);
    changed |= set_field(&mut current.family, family);
    changed |= set_field(&mut current.serial, serial);
    changed |= set_field(&mut current.pstate, pstate);
    changed |= set_field(&mut current.display_mode, display_mode);
    changed |= set_field(&mut current.mig, mig);
    changed
}

/// Copy `desired` health readings over `current`. Returns true if anything changed.
pub fn update_health(current: &mut GpuHealth, desired: GpuHealth) -> bool {
    let GpuHealth {
        temperature_celsius,
        power_usage_watts,
        utilization_percent,
        memory_used_mib,
        mig_enabled,
        mig_instances,
    } = desired;

    let mut changed = false;
    changed |= set_field(&mut current.temperature_celsius, temperature_celsius);
    changed |= set_field(&mut current.power_usage_watts, power_usage_watts);
    changed |= set_field(&mut current.utilization_percent, utilization_percent);
    changed |= set_field(&mut current.memory_used_mib, memory_used_mib);
    changed |= set_field(&mut current.mig_enabled, mig_enabled);
    changed |= set_field(&mut current.mig_instances, mig_instances);
    changed
}

/// Controller owner reference pointing at `node`.
pub fn node_owner_reference(node: &Node) -> Result<OwnerReference, ControllerError> {
    let uid = node
        .uid()
        .ok_or_else(|| ControllerError::InvalidConfig(format!("Node {} has no uid", node.name_any())))?;
    Ok(OwnerReference {
        api_version: "v1".to_string(),
        kind: "Node".to_string(),
        name: node.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Metadata patch needed to bring `meta` to the desired labels and owner,
/// or `None` when it already carries them.
///
/// Labels not named in `labels` are left alone.
pub fn metadata_patch(
    meta: &ObjectMeta,
    labels: BTreeMap<String, String>,
    owner: &OwnerReference,
) -> Option<MetadataPatch> {
    let current_labels = meta.labels.clone().unwrap_or_default();
    let labels_match = labels
        .iter()
        .all(|(key, value)| current_labels.get(key) == Some(value));
    let owners = std::slice::from_ref(owner);
    let owner_matches = meta.owner_references.as_deref() == Some(owners);

    if labels_match && owner_matches {
        return None;
    }
    Some(MetadataPatch {
        labels,
        owner_references: owners.to_vec(),
        resource_version: meta.resource_version.clone(),
    })
}

/// Outcome of merging a desired condition into a condition list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionChange {
    /// Nothing differed
    Unchanged,
    /// Only bookkeeping (observed generation) moved
    Refreshed,
    /// Status, reason or message changed
    Transitioned,
}

/// Merges `desired` into `conditions` by type.
///
/// `lastTransitionTime` moves to `now` only when the status flips (or the
/// condition is new); a reason or message change alone keeps the timestamp.
pub fn upsert_condition(
    conditions: &mut Vec<InventoryCondition>,
    desired: InventoryCondition,
    now: DateTime<Utc>,
) -> ConditionChange {
    let Some(current) = conditions.iter_mut().find(|c| c.type_ == desired.type_) else {
        conditions.push(InventoryCondition {
            last_transition_time: Some(now),
            ..desired
        });
        return ConditionChange::Transitioned;
    };

    let mut transitioned = false;
    if set_field(&mut current.status, desired.status) {
        current.last_transition_time = Some(now);
        transitioned = true;
    }
    transitioned |= set_field(&mut current.reason, desired.reason);
    transitioned |= set_field(&mut current.message, desired.message);
    if current.last_transition_time.is_none() {
        current.last_transition_time = Some(now);
    }
    let refreshed = set_field(&mut current.observed_generation, desired.observed_generation);

    if transitioned {
        ConditionChange::Transitioned
    } else if refreshed {
        ConditionChange::Refreshed
    } else {
        ConditionChange::Unchanged
    }
}
