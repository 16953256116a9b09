//! GPU Detection Client
//!
//! Client for the detection agents that run on GPU nodes and publish live
//! per-device readings (temperature, power, utilization, memory usage, MIG
//! mode). The inventory controller treats this data as best-effort
//! enrichment: every failure surfaces as a [`DetectionError`] which the caller
//! logs and ignores.
//!
//! # Example
//!
//! ```no_run
//! use detection_client::{DetectionClient, DetectionClientTrait};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DetectionClient::new(9400, Duration::from_secs(5))?;
//! let detection = client.fetch_detection("gpu-node-1", "10.0.0.12").await?;
//! for device in &detection.devices {
//!     println!("{} {:?}", device.index, device.temperature_celsius);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod detection_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::DetectionClient;
pub use detection_trait::DetectionClientTrait;
pub use error::DetectionError;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::MockDetectionClient;
