//! UID index over the nodes of one partition's graph

use super::node::Node;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Map from object UID to graph node
///
/// Readers (workers, the debug exporter) take short read locks; the graph
/// builder is the only writer.
#[derive(Debug, Default)]
pub struct UidToNode {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
}

impl UidToNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, uid: &str) -> Option<Arc<Node>> {
        self.nodes.read().get(uid).cloned()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.nodes.read().contains_key(uid)
    }

    /// Insert or replace the node stored under its UID
    pub fn write(&self, node: Arc<Node>) {
        self.nodes.write().insert(node.uid().to_string(), node);
    }

    pub fn delete(&self, uid: &str) {
        self.nodes.write().remove(uid);
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Point-in-time copy of the index
    pub fn snapshot(&self) -> HashMap<String, Arc<Node>> {
        self.nodes.read().clone()
    }
}
