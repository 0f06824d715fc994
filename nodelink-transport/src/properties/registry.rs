//! NodePropertiesRegistry: the merge target for property knowledge.

use std::collections::{BTreeSet, HashMap};

use super::NodeProperty;
use crate::NodeId;

/// Latest known entry per `(node, key)`.
#[derive(Debug, Default, Clone)]
pub struct NodePropertiesRegistry {
    entries: HashMap<(NodeId, String), NodeProperty>,
}

impl NodePropertiesRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `entries`, returning those that changed the registry.
    ///
    /// An entry is accepted iff its sequence number is strictly greater than
    /// the stored one for the same `(node, key)`; older or equal entries are
    /// ignored.
    pub fn merge_and_get_effective_subset(
        &mut self,
        entries: impl IntoIterator<Item = NodeProperty>,
    ) -> Vec<NodeProperty> {
        let mut effective = Vec::new();
        for entry in entries {
            let accepted = match self.entries.get(&entry.composite_key()) {
                Some(existing) => existing.sequence_no() < entry.sequence_no(),
                None => true,
            };
            if accepted {
                self.entries.insert(entry.composite_key(), entry.clone());
                effective.push(entry);
            }
        }
        effective
    }

    /// Store `entries` without comparing sequence numbers.
    ///
    /// Only for entries known to be newer, such as fresh local updates.
    pub fn merge_unchecked(&mut self, entries: impl IntoIterator<Item = NodeProperty>) {
        for entry in entries {
            self.entries.insert(entry.composite_key(), entry);
        }
    }

    /// The stored entry for `(node, key)`, tombstones included.
    pub fn get_node_property(&self, node: &NodeId, key: &str) -> Option<&NodeProperty> {
        self.entries.get(&(node.clone(), key.to_string()))
    }

    /// A copy of one node's non-null values.
    pub fn get_node_properties(&self, node: &NodeId) -> HashMap<String, String> {
        self.entries
            .values()
            .filter(|e| e.node_id() == node)
            .filter_map(|e| e.value().map(|v| (e.key().to_string(), v.to_string())))
            .collect()
    }

    /// Copies of the non-null values of every node with at least one entry.
    pub fn get_all_node_properties(&self) -> HashMap<NodeId, HashMap<String, String>> {
        let mut result: HashMap<NodeId, HashMap<String, String>> = HashMap::new();
        for entry in self.entries.values() {
            let values = result.entry(entry.node_id().clone()).or_default();
            if let Some(value) = entry.value() {
                values.insert(entry.key().to_string(), value.to_string());
            }
        }
        result
    }

    /// Like [`get_all_node_properties`](Self::get_all_node_properties),
    /// restricted to `nodes`; unknown nodes map to empty maps.
    pub fn get_all_node_properties_for<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a NodeId>,
    ) -> HashMap<NodeId, HashMap<String, String>> {
        nodes
            .into_iter()
            .map(|n| (n.clone(), self.get_node_properties(n)))
            .collect()
    }

    /// Every node with at least one entry.
    pub fn known_nodes(&self) -> BTreeSet<NodeId> {
        self.entries.values().map(|e| e.node_id().clone()).collect()
    }

    /// A copy of all entries, tombstones included.
    pub fn get_detached_copy_of_entries(&self) -> Vec<NodeProperty> {
        self.entries.values().cloned().collect()
    }

    /// Entries the holder of `known` is missing or has an older version of.
    pub fn get_complementing_knowledge(&self, known: &[NodeProperty]) -> Vec<NodeProperty> {
        let known: HashMap<(NodeId, String), i64> = known
            .iter()
            .map(|e| (e.composite_key(), e.sequence_no()))
            .collect();
        self.entries
            .iter()
            .filter(|(key, entry)| known.get(*key).is_none_or(|seq| *seq < entry.sequence_no()))
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Number of stored entries, tombstones included.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}
