//! Mock DetectionClient for unit testing
//!
//! Returns canned payloads per node, or a failure for nodes marked as
//! unreachable, without any network traffic.

use crate::detection_trait::DetectionClientTrait;
use crate::error::DetectionError;
use crate::models::NodeDetection;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

/// Mock DetectionClient for testing
#[derive(Debug, Clone, Default)]
pub struct MockDetectionClient {
    payloads: Arc<Mutex<HashMap<String, NodeDetection>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockDetectionClient {
    /// Create a new mock client with no payloads
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `detection` for `node_name`
    pub fn set_detection(&self, node_name: &str, detection: NodeDetection) {
        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_name.to_string(), detection);
    }

    /// Make every request for `node_name` fail
    pub fn fail_node(&self, node_name: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_name.to_string());
    }

    /// Requests made so far, as `(node_name, address)` pairs
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl DetectionClientTrait for MockDetectionClient {
    async fn fetch_detection(
        &self,
        node_name: &str,
        address: &str,
    ) -> Result<NodeDetection, DetectionError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((node_name.to_string(), address.to_string()));

        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(node_name)
        {
            return Err(DetectionError::Api(format!(
                "detection agent on node {} unreachable",
                node_name
            )));
        }

        if address.is_empty() {
            return Err(DetectionError::NoAddress(node_name.to_string()));
        }

        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_name)
            .cloned()
            .ok_or_else(|| DetectionError::Api(format!("no detection data for node {}", node_name)))
    }
}
