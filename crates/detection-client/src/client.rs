//! Detection agent HTTP client
//!
//! Agents serve `GET /api/v1/gpus` on a fixed port on every GPU node.

use crate::detection_trait::DetectionClientTrait;
use crate::error::DetectionError;
use crate::models::NodeDetection;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Detection agent client
#[derive(Debug, Clone)]
pub struct DetectionClient {
    client: Client,
    port: u16,
}

impl DetectionClient {
    /// Create a new detection client
    ///
    /// # Arguments
    /// * `port` - Port the agents listen on
    /// * `timeout` - Per-request timeout; keeps a dead agent from holding up a reconcile
    pub fn new(port: u16, timeout: Duration) -> Result<Self, DetectionError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(DetectionError::Http)?;

        Ok(Self { client, port })
    }

    fn url(&self, address: &str) -> String {
        // IPv6 literals need brackets
        if address.contains(':') && !address.starts_with('[') {
            format!("http://[{}]:{}/api/v1/gpus", address, self.port)
        } else {
            format!("http://{}:{}/api/v1/gpus", address, self.port)
        }
    }
}

#[async_trait::async_trait]
impl DetectionClientTrait for DetectionClient {
    async fn fetch_detection(
        &self,
        node_name: &str,
        address: &str,
    ) -> Result<NodeDetection, DetectionError> {
        if address.is_empty() {
            return Err(DetectionError::NoAddress(node_name.to_string()));
        }

        let url = self.url(address);
        debug!("Fetching GPU detection data for node {} from {}", node_name, url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectionError::Api(format!(
                "Failed to fetch detection data for node {}: {} - {}",
                node_name,
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        let body = response.text().await?;
        let detection: NodeDetection = serde_json::from_str(&body)?;
        debug!(
            "Received detection data for {} device(s) on node {}",
            detection.devices.len(),
            node_name
        );
        Ok(detection)
    }
}
