//! Detection client errors

use thiserror::Error;

/// Errors that can occur when querying a detection agent
#[derive(Debug, Error)]
pub enum DetectionError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Agent answered with a non-success status
    #[error("Detection API error: {0}")]
    Api(String),

    /// Payload could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Node has no address the agent can be reached on
    #[error("Node {0} has no reachable address")]
    NoAddress(String),
}
