//! NodeFeature (Node Feature Discovery) types
//!
//! Consumed, never written. Only the parts the inventory controller reads are
//! modelled: the bulk label map and the instance feature sets.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label NFD puts on NodeFeature objects to point at their node
pub const NFD_NODE_NAME_LABEL: &str = "nfd.node.kubernetes.io/node-name";

/// Namespace NFD applies to label keys published without one
pub const NFD_DEFAULT_LABEL_NAMESPACE: &str = "feature.node.kubernetes.io/";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "nfd.k8s-sigs.io",
    version = "v1alpha1",
    kind = "NodeFeature",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NodeFeatureSpec {
    /// Raw features discovered on the node
    #[serde(default)]
    pub features: Features,

    /// Labels requested for the node; unnamed keys live in the NFD default namespace
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Feature sets of a NodeFeature
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    /// Instance features keyed by feature name, e.g. `pci.device`
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceFeatureSet>,
}

/// A named list of feature instances
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceFeatureSet {
    /// One entry per device instance
    #[serde(default)]
    pub elements: Vec<InstanceFeature>,
}

/// One feature instance: a flat attribute map
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceFeature {
    /// Attribute values such as `vendor` or `index`
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl NodeFeature {
    /// Bulk labels with unnamed keys moved into the NFD default namespace.
    pub fn namespaced_labels(&self) -> BTreeMap<String, String> {
        self.spec
            .labels
            .iter()
            .map(|(key, value)| {
                if key.contains('/') {
                    (key.clone(), value.clone())
                } else {
                    (format!("{}{}", NFD_DEFAULT_LABEL_NAMESPACE, key), value.clone())
                }
            })
            .collect()
    }

    /// Attribute maps of the named instance feature set (empty when absent).
    pub fn instances(&self, feature: &str) -> impl Iterator<Item = &BTreeMap<String, String>> {
        self.spec
            .features
            .instances
            .get(feature)
            .into_iter()
            .flat_map(|set| set.elements.iter().map(|element| &element.attributes))
    }
}
