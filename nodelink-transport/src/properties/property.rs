use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// One published key/value entry of a node.
///
/// Identity is `(node, key)`: two entries with different values or
/// sequence numbers for the same node and key are equal. A `None` value is a
/// tombstone that supersedes an earlier value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProperty {
    node_id: NodeId,
    key: String,
    value: Option<String>,
    sequence_no: i64,
}

impl NodeProperty {
    /// Create an entry.
    pub fn new(
        node_id: NodeId,
        key: impl Into<String>,
        value: Option<String>,
        sequence_no: i64,
    ) -> Self {
        Self {
            node_id,
            key: key.into(),
            value,
            sequence_no,
        }
    }

    /// The publishing node.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// String form of the publishing node's id.
    pub fn node_id_string(&self) -> String {
        self.node_id.to_string()
    }

    /// Property key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Property value; `None` once the property was removed.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Sequence number assigned by the publishing node.
    pub fn sequence_no(&self) -> i64 {
        self.sequence_no
    }

    pub(crate) fn composite_key(&self) -> (NodeId, String) {
        (self.node_id.clone(), self.key.clone())
    }
}

impl PartialEq for NodeProperty {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id && self.key == other.key
    }
}

impl Eq for NodeProperty {}

impl Hash for NodeProperty {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
        self.key.hash(state);
    }
}

impl std::fmt::Display for NodeProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:={}[{}]",
            self.node_id,
            self.key,
            self.value.as_deref().unwrap_or("<null>"),
            self.sequence_no
        )
    }
}
