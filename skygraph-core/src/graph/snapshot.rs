//! Serializable graph dumps for debugging.

use serde::Serialize;

use super::node::{DirtyState, NodeEntry, NodeState, Version};
use super::store::GraphStore;

/// Point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    pub key: String,
    pub state: NodeState,
    pub dirty: DirtyState,
    pub version: Version,
    pub verified_version: Version,
    pub generation: u32,
    pub injected: bool,
    pub value: Option<String>,
    pub error: Option<String>,
    pub direct_deps: Vec<Vec<String>>,
    pub reverse_deps: Vec<String>,
}

impl NodeSnapshot {
    fn capture(node: &NodeEntry) -> Self {
        Self {
            key: node.key().to_string(),
            state: node.state(),
            dirty: node.dirty_state(),
            version: node.version(),
            verified_version: node.verified_version(),
            generation: node.generation(),
            injected: node.is_injected(),
            value: node.value().map(|value| format!("{value:?}")),
            error: node.error().map(ToString::to_string),
            direct_deps: node
                .direct_deps()
                .iter()
                .map(|group| group.iter().map(ToString::to_string).collect())
                .collect(),
            reverse_deps: node.reverse_deps().iter().map(ToString::to_string).collect(),
        }
    }
}

/// Point-in-time view of the whole graph, ordered by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphSnapshot {
    pub version: Version,
    pub nodes: Vec<NodeSnapshot>,
}

impl GraphSnapshot {
    /// Capture every node. Nodes are locked one at a time, so the snapshot is
    /// only consistent when no evaluation is running.
    pub fn capture(graph: &GraphStore) -> Self {
        let mut nodes: Vec<NodeSnapshot> = graph
            .handles()
            .iter()
            .map(|handle| NodeSnapshot::capture(&handle.lock()))
            .collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            version: graph.current_version(),
            nodes,
        }
    }

    /// Look a node up by its rendered key.
    pub fn node(&self, key: &str) -> Option<&NodeSnapshot> {
        self.nodes
            .binary_search_by(|node| node.key.as_str().cmp(key))
            .ok()
            .map(|index| &self.nodes[index])
    }

    /// Render as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
