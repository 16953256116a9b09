//! DetectionClient trait for mocking

use crate::error::DetectionError;
use crate::models::NodeDetection;

/// Trait for detection agent operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait DetectionClientTrait: Send + Sync {
    /// Fetch the current detection payload of `node_name`, reachable at `address`.
    async fn fetch_detection(
        &self,
        node_name: &str,
        address: &str,
    ) -> Result<NodeDetection, DetectionError>;
}
