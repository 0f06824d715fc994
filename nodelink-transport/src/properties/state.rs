//! NodePropertiesStateService: the reachable part of the property directory.
//!
//! Combines raw property changes with reachability changes. Properties of
//! nodes that become unreachable are reported as removed, and reported as
//! added again when their node comes back.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{NodePropertiesService, NodeProperty, RawNodePropertiesChangeListener};
use crate::NodeId;
use crate::callbacks::OrderedCallbacks;
use crate::topology::{ReachableNodesListener, TopologyService};

/// Value maps per node; `None` marks a node that became unreachable.
pub type NodeValueMaps = HashMap<NodeId, Option<HashMap<String, String>>>;

/// Observer of the reachable property state.
pub trait NodePropertiesChangeListener: Send + Sync {
    /// Properties of reachable nodes were added, updated or removed.
    ///
    /// The first call after registration carries all reachable properties
    /// as `added`.
    fn on_reachable_node_properties_changed(
        &self,
        _added: &[NodeProperty],
        _updated: &[NodeProperty],
        _removed: &[NodeProperty],
    ) {
    }

    /// The complete value maps of the listed nodes changed.
    fn on_node_property_maps_of_nodes_changed(&self, _value_maps: &NodeValueMaps) {}
}

#[derive(Default)]
struct State {
    by_node: HashMap<NodeId, HashMap<String, NodeProperty>>,
    value_maps: HashMap<NodeId, HashMap<String, String>>,
    reachable_nodes: BTreeSet<NodeId>,
    reachable_properties: HashSet<NodeProperty>,
}

impl State {
    fn value_map(&self, node: &NodeId) -> HashMap<String, String> {
        self.by_node
            .get(node)
            .map(|properties| {
                properties
                    .values()
                    .filter_map(|p| p.value().map(|v| (p.key().to_string(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Reachability-filtered property view with change notification.
pub struct NodePropertiesStateService {
    state: Mutex<State>,
    callbacks: OrderedCallbacks<dyn NodePropertiesChangeListener>,
}

impl NodePropertiesStateService {
    /// Create the service and subscribe it to `properties` and `topology`.
    pub fn new(properties: &NodePropertiesService, topology: &TopologyService) -> Arc<Self> {
        let service = Arc::new(Self {
            state: Mutex::new(State::default()),
            callbacks: OrderedCallbacks::default(),
        });
        let weak = Arc::downgrade(&service);
        properties.add_raw_node_properties_change_listener(Arc::new(StateFeed {
            service: weak.clone(),
        }));
        topology.add_reachable_nodes_listener(Arc::new(StateFeed { service: weak }));
        service
    }

    /// Register a listener; its first callback carries all reachable
    /// properties and value maps.
    pub fn add_node_properties_change_listener(
        &self,
        listener: Arc<dyn NodePropertiesChangeListener>,
    ) {
        let state = self.state.lock();
        let properties: Vec<NodeProperty> = state.reachable_properties.iter().cloned().collect();
        let maps: NodeValueMaps = state
            .reachable_nodes
            .iter()
            .filter_map(|n| state.value_maps.get(n).map(|m| (n.clone(), Some(m.clone()))))
            .collect();
        self.callbacks.add_listener_with_initial(listener, move |l| {
            l.on_reachable_node_properties_changed(&properties, &[], &[]);
            l.on_node_property_maps_of_nodes_changed(&maps);
        });
    }

    /// Non-null properties of `node` if it is reachable.
    pub fn reachable_node_properties(&self, node: &NodeId) -> Option<HashMap<String, String>> {
        let state = self.state.lock();
        if state.reachable_nodes.contains(node) {
            Some(state.value_maps.get(node).cloned().unwrap_or_default())
        } else {
            None
        }
    }

    fn on_raw_changes(&self, changes: &[NodeProperty]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (mut added, mut updated, mut removed) = (Vec::new(), Vec::new(), Vec::new());
        let mut touched: BTreeSet<NodeId> = BTreeSet::new();

        for property in changes {
            let node = property.node_id().clone();
            let reachable = state.reachable_nodes.contains(&node);
            touched.insert(node.clone());
            let by_key = state.by_node.entry(node).or_default();
            if property.value().is_some() {
                let was_present = by_key
                    .insert(property.key().to_string(), property.clone())
                    .is_some();
                if reachable {
                    state.reachable_properties.replace(property.clone());
                    if was_present {
                        updated.push(property.clone());
                    } else {
                        added.push(property.clone());
                    }
                }
            } else {
                let was_present = by_key.remove(property.key()).is_some();
                if reachable && was_present {
                    state.reachable_properties.remove(property);
                    removed.push(property.clone());
                }
            }
        }

        if !added.is_empty() || !updated.is_empty() || !removed.is_empty() {
            self.callbacks.enqueue(move |l| {
                l.on_reachable_node_properties_changed(&added, &updated, &removed)
            });
        }

        let mut maps: NodeValueMaps = HashMap::new();
        for node in touched {
            let map = state.value_map(&node);
            if state.reachable_nodes.contains(&node) {
                maps.insert(node.clone(), Some(map.clone()));
            }
            state.value_maps.insert(node, map);
        }
        if !maps.is_empty() {
            self.callbacks.enqueue(move |l| l.on_node_property_maps_of_nodes_changed(&maps));
        }
    }

    fn on_reachability_changed(
        &self,
        reachable: &BTreeSet<NodeId>,
        added: &BTreeSet<NodeId>,
        removed: &BTreeSet<NodeId>,
    ) {
        let mut state = self.state.lock();
        let mut maps: NodeValueMaps = HashMap::new();

        let mut disconnected = Vec::new();
        for node in removed {
            if let Some(properties) = state.by_node.get(node) {
                disconnected.extend(properties.values().cloned());
            }
            maps.insert(node.clone(), None);
        }
        let mut reconnected = Vec::new();
        for node in added {
            if let Some(properties) = state.by_node.get(node) {
                reconnected.extend(properties.values().cloned());
            }
            let values = state.value_maps.get(node).cloned().unwrap_or_default();
            maps.insert(node.clone(), Some(values));
        }

        for property in &disconnected {
            state.reachable_properties.remove(property);
        }
        state.reachable_properties.extend(reconnected.iter().cloned());
        state.reachable_nodes = reachable.clone();

        if !disconnected.is_empty() || !reconnected.is_empty() {
            tracing::debug!(
                disconnected = disconnected.len(),
                reconnected = reconnected.len(),
                "reachable property set changed after topology change"
            );
            self.callbacks.enqueue(move |l| {
                l.on_reachable_node_properties_changed(&reconnected, &[], &disconnected)
            });
        }
        if !maps.is_empty() {
            self.callbacks.enqueue(move |l| l.on_node_property_maps_of_nodes_changed(&maps));
        }
    }
}

struct StateFeed {
    service: Weak<NodePropertiesStateService>,
}

impl RawNodePropertiesChangeListener for StateFeed {
    fn on_raw_node_properties_added_or_modified(&self, properties: &[NodeProperty]) {
        if let Some(service) = self.service.upgrade() {
            service.on_raw_changes(properties);
        }
    }
}

impl ReachableNodesListener for StateFeed {
    fn on_reachable_nodes_changed(
        &self,
        reachable: &BTreeSet<NodeId>,
        added: &BTreeSet<NodeId>,
        removed: &BTreeSet<NodeId>,
    ) {
        if let Some(service) = self.service.upgrade() {
            service.on_reachability_changed(reachable, added, removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare() -> NodePropertiesStateService {
        NodePropertiesStateService {
            state: Mutex::new(State::default()),
            callbacks: OrderedCallbacks::default(),
        }
    }

    #[test]
    fn test_unreachable_properties_are_held_back() {
        let service = bare();
        let node = NodeId::generate();
        service.on_raw_changes(&[NodeProperty::new(node.clone(), "k", Some("v".to_string()), 1)]);
        assert_eq!(service.reachable_node_properties(&node), None);

        let only_node = BTreeSet::from([node.clone()]);
        service.on_reachability_changed(&only_node, &only_node, &BTreeSet::new());
        let values = service.reachable_node_properties(&node).expect("reachable");
        assert_eq!(values.get("k").map(String::as_str), Some("v"));
        assert_eq!(service.state.lock().reachable_properties.len(), 1);

        service.on_raw_changes(&[NodeProperty::new(node.clone(), "k", None, 2)]);
        assert!(service.reachable_node_properties(&node).expect("reachable").is_empty());
        assert!(service.state.lock().reachable_properties.is_empty());

        service.on_reachability_changed(&BTreeSet::new(), &BTreeSet::new(), &only_node);
        assert_eq!(service.reachable_node_properties(&node), None);
    }
}
