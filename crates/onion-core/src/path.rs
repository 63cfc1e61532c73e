//! Onion paths

use serde::{Deserialize, Serialize};

use crate::{NodeKey, ServiceNode};

/// Ordered relay nodes, guard first and exit last
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnionPath {
    pub nodes: Vec<ServiceNode>,
}

impl OnionPath {
    pub fn new(nodes: Vec<ServiceNode>) -> Self {
        Self { nodes }
    }

    pub fn guard(&self) -> Option<&ServiceNode> {
        self.nodes.first()
    }

    pub fn exit(&self) -> Option<&ServiceNode> {
        self.nodes.last()
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.position(key).is_some()
    }

    pub fn position(&self, key: &NodeKey) -> Option<usize> {
        self.nodes.iter().position(|n| n.key() == key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Hops after the guard
    pub fn relays(&self) -> &[ServiceNode] {
        self.nodes.get(1..).unwrap_or(&[])
    }
}
