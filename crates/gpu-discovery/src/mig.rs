//! MIG capability parsing from node labels

use std::collections::BTreeMap;

use crds::{MigCapability, MigProfileCapacity, MigStrategy};

use crate::labels::{
    MIG_CAPABLE, MIG_CAPABLE_LEGACY, MIG_PROFILE_PREFIX, MIG_STRATEGY, MIG_STRATEGY_LEGACY,
};
use crate::parse::{parse_bool, parse_leading_int, parse_memory_mib};

/// Returns the value of the first key present in `labels`.
fn first_present<'a>(labels: &'a BTreeMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| labels.get(*key))
        .map(String::as_str)
}

/// Parses MIG capability, strategy and per-profile capacities.
///
/// Capacity labels have the shape `nvidia.com/mig-<size>.<memory>.<metric>`.
/// A profile whose labels carry no recognized metric is still listed as
/// supported but gets no capacity entry. Any profile makes the device
/// MIG-capable.
pub fn parse_mig(labels: &BTreeMap<String, String>) -> MigCapability {
    let explicit_capable = first_present(labels, &[MIG_CAPABLE, MIG_CAPABLE_LEGACY])
        .and_then(parse_bool)
        .unwrap_or(false);
    let strategy = first_present(labels, &[MIG_STRATEGY, MIG_STRATEGY_LEGACY])
        .map(MigStrategy::parse)
        .unwrap_or_default();

    let mut profiles: BTreeMap<String, Option<MigProfileCapacity>> = BTreeMap::new();

    for (key, value) in labels {
        let Some(rest) = key.strip_prefix(MIG_PROFILE_PREFIX) else {
            continue;
        };
        let parts: Vec<&str> = rest.splitn(3, '.').collect();
        let [size, memory, metric] = parts.as_slice() else {
            continue;
        };
        if size.is_empty() || memory.is_empty() || metric.is_empty() {
            continue;
        }

        let profile = format!("mig-{size}.{memory}");
        let entry = profiles.entry(profile.clone()).or_default();

        let int = || parse_leading_int(value).unwrap_or(0);
        let capacity = || MigProfileCapacity {
            profile: profile.clone(),
            ..Default::default()
        };

        match *metric {
            "count" | "available" | "ready" => entry.get_or_insert_with(capacity).count = int(),
            "memory" => entry.get_or_insert_with(capacity).memory_mib = parse_memory_mib(value),
            "multiprocessors" => entry.get_or_insert_with(capacity).multiprocessors = int(),
            "engines.copy" => entry.get_or_insert_with(capacity).copy_engines = int(),
            "engines.decoder" => entry.get_or_insert_with(capacity).decoders = int(),
            "engines.encoder" => entry.get_or_insert_with(capacity).encoders = int(),
            "engines.jpeg" => entry.get_or_insert_with(capacity).jpeg_engines = int(),
            "engines.ofa" => entry.get_or_insert_with(capacity).ofa_engines = int(),
            _ => {}
        }
    }

    MigCapability {
        capable: explicit_capable || !profiles.is_empty(),
        strategy,
        profiles: profiles.keys().cloned().collect(),
        capacities: profiles.into_values().flatten().collect(),
    }
}
