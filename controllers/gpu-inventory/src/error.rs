//! Controller-specific error types.
//!
//! This module defines error types specific to the GPU Inventory Controller
//! that are not covered by upstream library errors.

use crate::approval::ApprovalPolicyError;
use crate::store::StoreError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the GPU Inventory Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cluster store error other than a conflict or a missing object
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Device approval policy could not be built
    #[error("Approval policy error: {0}")]
    ApprovalPolicy(#[from] ApprovalPolicyError),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
