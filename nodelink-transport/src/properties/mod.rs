//! Node properties: a small, eventually consistent key/value directory.
//!
//! Every node publishes string properties about itself. Each entry carries
//! a per-node sequence number; a received entry replaces the stored one
//! only if its sequence number is strictly greater, so merging is
//! idempotent and order-independent.

mod batch;
mod property;
mod registry;
mod sequence;
mod service;
mod state;

pub use property::NodeProperty;
pub use registry::NodePropertiesRegistry;
pub use service::{NodePropertiesService, RawNodePropertiesChangeListener};
pub use state::{NodePropertiesChangeListener, NodePropertiesStateService, NodeValueMaps};
