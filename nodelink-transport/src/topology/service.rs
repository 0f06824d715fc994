use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{LINKS_PROPERTY, NetworkGraph, RELAY_PROPERTY};
use crate::NodeId;
use crate::callbacks::OrderedCallbacks;
use crate::channel::{MessageChannel, MessageChannelLifecycleListener, MessageChannelService};
use crate::properties::{NodePropertiesService, NodeProperty, RawNodePropertiesChangeListener};

/// Observer of the reachable node set.
pub trait ReachableNodesListener: Send + Sync {
    /// The reachable set changed. `added` and `removed` are disjoint and
    /// `added` is a subset of `reachable`.
    ///
    /// The first call after registration reports `(all, all, {})`.
    fn on_reachable_nodes_changed(
        &self,
        reachable: &BTreeSet<NodeId>,
        added: &BTreeSet<NodeId>,
        removed: &BTreeSet<NodeId>,
    );
}

struct TopologyState {
    graph: NetworkGraph,
    reachable: BTreeSet<NodeId>,
    published_links: Option<BTreeSet<NodeId>>,
}

/// Keeps the [`NetworkGraph`] current and reports reachability changes.
pub struct TopologyService {
    local_node_id: NodeId,
    channels: Arc<MessageChannelService>,
    properties: Arc<NodePropertiesService>,
    state: Mutex<TopologyState>,
    callbacks: OrderedCallbacks<dyn ReachableNodesListener>,
}

impl TopologyService {
    /// Create the service, publish the relay flag and start following
    /// channel and property changes. Requires a tokio runtime.
    pub fn new(
        channels: Arc<MessageChannelService>,
        properties: Arc<NodePropertiesService>,
    ) -> Arc<Self> {
        let local_node_id = channels.local_node_id().clone();
        let service = Arc::new(Self {
            local_node_id: local_node_id.clone(),
            channels: channels.clone(),
            properties: properties.clone(),
            state: Mutex::new(TopologyState {
                graph: NetworkGraph::new(local_node_id.clone()),
                reachable: BTreeSet::from([local_node_id]),
                published_links: None,
            }),
            callbacks: OrderedCallbacks::default(),
        });

        properties
            .add_or_update_local_property(RELAY_PROPERTY, Some(properties.is_relay().to_string()));
        let weak = Arc::downgrade(&service);
        channels.add_lifecycle_listener(Arc::new(TopologyTrigger { service: weak.clone() }));
        properties
            .add_raw_node_properties_change_listener(Arc::new(TopologyTrigger { service: weak }));
        service.refresh();
        service
    }

    /// All currently reachable nodes, including the local node.
    pub fn reachable_nodes(&self) -> BTreeSet<NodeId> {
        self.state.lock().reachable.clone()
    }

    /// Whether `node` is currently reachable.
    pub fn is_reachable(&self, node: &NodeId) -> bool {
        self.state.lock().reachable.contains(node)
    }

    /// The neighbour to send to for reaching `target`.
    pub fn next_hop(&self, target: &NodeId) -> Option<NodeId> {
        self.state.lock().graph.next_hop(target)
    }

    /// A copy of the current graph.
    pub fn graph(&self) -> NetworkGraph {
        self.state.lock().graph.clone()
    }

    /// Register a listener; it first receives `(all, all, {})`.
    pub fn add_reachable_nodes_listener(&self, listener: Arc<dyn ReachableNodesListener>) {
        let state = self.state.lock();
        let reachable = state.reachable.clone();
        self.callbacks.add_listener_with_initial(listener, move |l| {
            l.on_reachable_nodes_changed(&reachable, &reachable, &BTreeSet::new())
        });
    }

    /// Recompute the graph from channels and properties.
    fn refresh(&self) {
        self.publish_links_if_changed(&self.channels.connected_nodes());

        // Held while reading inputs so concurrent refreshes apply in order.
        let mut state = self.state.lock();
        let neighbours = self.channels.connected_nodes();
        let all_properties = self.properties.get_all_node_properties();
        let graph = build_graph(&self.local_node_id, &neighbours, &all_properties);
        let reachable = graph.reachable_nodes();
        state.graph = graph;
        if state.reachable == reachable {
            return;
        }
        let added: BTreeSet<NodeId> = reachable.difference(&state.reachable).cloned().collect();
        let removed: BTreeSet<NodeId> = state.reachable.difference(&reachable).cloned().collect();
        tracing::debug!(
            node = %self.local_node_id,
            reachable = reachable.len(),
            added = added.len(),
            removed = removed.len(),
            "reachable nodes changed"
        );
        state.reachable = reachable.clone();
        self.callbacks
            .enqueue(move |l| l.on_reachable_nodes_changed(&reachable, &added, &removed));
    }

    fn publish_links_if_changed(&self, neighbours: &BTreeSet<NodeId>) {
        {
            let mut state = self.state.lock();
            if state.published_links.as_ref() == Some(neighbours) {
                return;
            }
            state.published_links = Some(neighbours.clone());
        }
        let links = neighbours
            .iter()
            .map(NodeId::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.properties.add_or_update_local_property(LINKS_PROPERTY, Some(links));
    }
}

fn build_graph(
    local: &NodeId,
    neighbours: &BTreeSet<NodeId>,
    all_properties: &HashMap<NodeId, HashMap<String, String>>,
) -> NetworkGraph {
    let mut graph = NetworkGraph::new(local.clone());
    for neighbour in neighbours {
        graph.add_link(local.clone(), neighbour.clone());
    }
    for (node, properties) in all_properties {
        if node == local {
            continue;
        }
        graph.add_node(node.clone());
        if properties.get(RELAY_PROPERTY).map(String::as_str) == Some("true") {
            graph.mark_relay(node.clone());
        }
        let Some(links) = properties.get(LINKS_PROPERTY) else {
            continue;
        };
        for link in links.split(',').filter(|s| !s.is_empty()) {
            match link.parse::<NodeId>() {
                Ok(to) => graph.add_link(node.clone(), to),
                Err(e) => tracing::warn!(%node, %link, error = %e, "ignoring malformed link entry"),
            }
        }
    }
    graph
}

struct TopologyTrigger {
    service: Weak<TopologyService>,
}

impl TopologyTrigger {
    fn refresh(&self) {
        if let Some(service) = self.service.upgrade() {
            service.refresh();
        }
    }
}

impl MessageChannelLifecycleListener for TopologyTrigger {
    fn on_channel_established(&self, _channel: &Arc<dyn MessageChannel>) {
        self.refresh();
    }

    fn on_channel_closed(&self, _channel: &Arc<dyn MessageChannel>) {
        self.refresh();
    }
}

impl RawNodePropertiesChangeListener for TopologyTrigger {
    fn on_raw_node_properties_added_or_modified(&self, properties: &[NodeProperty]) {
        if properties
            .iter()
            .any(|p| p.key() == LINKS_PROPERTY || p.key() == RELAY_PROPERTY)
        {
            self.refresh();
        }
    }
}
