//! Test utilities for unit testing reconcilers
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use std::collections::BTreeMap;
use std::sync::Arc;

use crds::{Features, InstanceFeature, InstanceFeatureSet, NFD_NODE_NAME_LABEL, NodeFeature, NodeFeatureSpec};
use detection_client::MockDetectionClient;
use gpu_discovery::labels::GPU_INSTANCE_FEATURE;
use gpu_discovery::{SnapshotBuilder, StaticCatalog};
use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::{ControllerConfig, EffectivePolicy};
use crate::events::RecordingEventSink;
use crate::reconciler::Reconciler;
use crate::store::mock::MockInventoryStore;

/// Converts `(key, value)` pairs into a label map
pub fn label_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Per-device labels for one GPU at `index`
pub fn gpu_labels(index: &str, device: &str) -> Vec<(String, String)> {
    let prefix = format!("gpu.dcops.microscaler.io/device.{index}");
    vec![
        (format!("{prefix}.vendor"), "10de".to_string()),
        (format!("{prefix}.device"), device.to_string()),
        (format!("{prefix}.class"), "0302".to_string()),
    ]
}

/// Helper to create a test Node with a uid and an InternalIP
pub fn create_test_node(name: &str, labels: BTreeMap<String, String>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("{name}-uid")),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(NodeStatus {
            addresses: Some(vec![
                NodeAddress {
                    type_: "Hostname".to_string(),
                    address: name.to_string(),
                },
                NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: "10.0.0.7".to_string(),
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Helper to create a test node with `count` V100s labelled at indices 0..count
pub fn create_gpu_node(name: &str, count: usize) -> Node {
    let labels: BTreeMap<String, String> = (0..count)
        .flat_map(|i| gpu_labels(&i.to_string(), "1db5"))
        .collect();
    create_test_node(name, labels)
}

/// Helper to create a test NodeFeature named after its node
pub fn create_test_node_feature(
    node_name: &str,
    labels: BTreeMap<String, String>,
    instances: Vec<BTreeMap<String, String>>,
) -> NodeFeature {
    let mut feature = NodeFeature::new(
        node_name,
        NodeFeatureSpec {
            features: Features {
                instances: [(
                    GPU_INSTANCE_FEATURE.to_string(),
                    InstanceFeatureSet {
                        elements: instances
                            .into_iter()
                            .map(|attributes| InstanceFeature { attributes })
                            .collect(),
                    },
                )]
                .into_iter()
                .collect(),
            },
            labels,
        },
    );
    feature.metadata.namespace = Some("node-feature-discovery".to_string());
    feature.metadata.labels = Some(label_map(&[(NFD_NODE_NAME_LABEL, node_name)]));
    feature
}

/// Mock collaborators shared between a test and the reconciler it drives
#[derive(Debug, Clone, Default)]
pub struct TestHarness {
    pub store: MockInventoryStore,
    pub events: RecordingEventSink,
    pub detection: MockDetectionClient,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciler with the default (manual approval) policy and no detection
    pub fn reconciler(&self) -> Reconciler {
        self.reconciler_with_policy(default_policy())
    }

    /// Reconciler wired to this harness with `policy` as the static policy
    pub fn reconciler_with_policy(&self, policy: EffectivePolicy) -> Reconciler {
        Reconciler::new(
            self.store.clone(),
            self.events.clone(),
            SnapshotBuilder::new(Arc::new(StaticCatalog::new())),
            policy,
        )
    }

    /// Reconciler that also queries the mock detection client
    pub fn reconciler_with_detection(&self) -> Reconciler {
        self.reconciler().with_detection(self.detection.clone())
    }
}

/// Manual approval, every GPU node managed
pub fn default_policy() -> EffectivePolicy {
    match ControllerConfig::default().static_policy() {
        Ok(policy) => policy,
        Err(e) => panic!("default policy must build: {e}"),
    }
}
