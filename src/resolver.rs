use std::collections::HashMap;
use std::sync::RwLock;

use crate::raft::RaftError;

/// Supplies the node_id to network address mapping. A resolution failure
/// degrades only that peer; the rest of the group keeps replicating.
pub trait NodeResolver: Send + Sync {
    fn resolve(&self, node_id: u64) -> Result<String, RaftError>;
}

/// Fixed table resolver, sufficient for tests and static deployments.
pub struct StaticResolver {
    nodes: RwLock<HashMap<u64, String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_node(&self, node_id: u64, address: &str) {
        self.nodes
            .write()
            .unwrap()
            .insert(node_id, address.to_string());
    }

    pub fn remove_node(&self, node_id: u64) {
        self.nodes.write().unwrap().remove(&node_id);
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeResolver for StaticResolver {
    fn resolve(&self, node_id: u64) -> Result<String, RaftError> {
        self.nodes
            .read()
            .unwrap()
            .get(&node_id)
            .cloned()
            .ok_or_else(|| RaftError::InvalidArgument(format!("unknown node id {node_id}")))
    }
}
