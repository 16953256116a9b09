//! GPU Discovery
//!
//! Turns the loosely structured hardware signals published about a node (its
//! labels and the Node Feature Discovery `NodeFeature` object) into one
//! canonical [`NodeSnapshot`].
//!
//! The builder never fails: unparsable values degrade to their zero value and
//! malformed keys are skipped, so partial discovery data never stalls
//! reconciliation.

pub mod catalog;
pub mod labels;
pub mod mig;
pub mod parse;
pub mod snapshot;

pub use catalog::{HardwareCatalog, StaticCatalog};
pub use mig::parse_mig;
pub use snapshot::{DeviceSnapshot, ManagedNodesPolicy, NodeSnapshot, SnapshotBuilder};
