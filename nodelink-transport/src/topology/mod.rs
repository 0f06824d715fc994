//! Network topology derived from published link properties.
//!
//! Every node publishes its direct neighbours under [`LINKS_PROPERTY`] and
//! its relay flag under [`RELAY_PROPERTY`]. Combined with the local channels
//! this yields a [`NetworkGraph`], from which the reachable node set and
//! next hops are computed.

mod graph;
mod service;

pub use graph::NetworkGraph;
pub use service::{ReachableNodesListener, TopologyService};

/// Property key holding a node's comma-separated neighbour ids.
pub const LINKS_PROPERTY: &str = "nodelink.links";

/// Property key holding `"true"` for relay nodes.
pub const RELAY_PROPERTY: &str = "nodelink.relay";
