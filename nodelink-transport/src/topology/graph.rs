use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::NodeId;

/// Directed graph of published links, seen from the local node.
///
/// Only the local node and relays pass traffic on, so a node is reachable
/// iff a path leads to it whose inner nodes are all relays.
#[derive(Debug, Clone)]
pub struct NetworkGraph {
    local: NodeId,
    links: BTreeMap<NodeId, BTreeSet<NodeId>>,
    relays: BTreeSet<NodeId>,
}

impl NetworkGraph {
    /// Create a graph containing only the local node.
    pub fn new(local: NodeId) -> Self {
        let mut links = BTreeMap::new();
        links.insert(local.clone(), BTreeSet::new());
        Self {
            local,
            links,
            relays: BTreeSet::new(),
        }
    }

    /// The node all paths start at.
    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    /// Add a node without links.
    pub fn add_node(&mut self, node: NodeId) {
        self.links.entry(node).or_default();
    }

    /// Add a directed link.
    pub fn add_link(&mut self, from: NodeId, to: NodeId) {
        self.add_node(to.clone());
        self.links.entry(from).or_default().insert(to);
    }

    /// Mark `node` as forwarding traffic for others.
    pub fn mark_relay(&mut self, node: NodeId) {
        self.relays.insert(node);
    }

    /// Number of nodes, reachable or not.
    pub fn node_count(&self) -> usize {
        self.links.len()
    }

    /// Number of directed links.
    pub fn link_count(&self) -> usize {
        self.links.values().map(BTreeSet::len).sum()
    }

    /// All reachable nodes, including the local node.
    pub fn reachable_nodes(&self) -> BTreeSet<NodeId> {
        let mut reachable: BTreeSet<NodeId> = self.first_hops().into_keys().collect();
        reachable.insert(self.local.clone());
        reachable
    }

    /// The neighbour to send to for reaching `target`.
    pub fn next_hop(&self, target: &NodeId) -> Option<NodeId> {
        self.first_hops().remove(target)
    }

    /// Breadth-first search recording the first hop towards each node.
    fn first_hops(&self) -> HashMap<NodeId, NodeId> {
        let mut first_hops: HashMap<NodeId, NodeId> = HashMap::new();
        let mut queue = VecDeque::from([self.local.clone()]);
        while let Some(node) = queue.pop_front() {
            let is_local = node == self.local;
            if !is_local && !self.relays.contains(&node) {
                continue;
            }
            let Some(neighbours) = self.links.get(&node) else {
                continue;
            };
            for neighbour in neighbours {
                if *neighbour == self.local || first_hops.contains_key(neighbour) {
                    continue;
                }
                let hop = if is_local {
                    neighbour.clone()
                } else {
                    match first_hops.get(&node) {
                        Some(hop) => hop.clone(),
                        None => continue,
                    }
                };
                first_hops.insert(neighbour.clone(), hop);
                queue.push_back(neighbour.clone());
            }
        }
        first_hops
    }
}
