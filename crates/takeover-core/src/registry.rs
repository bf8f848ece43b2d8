//! Stable surrogate keys for panels.
//!
//! The host gives panels no identity beyond their position, and positions
//! shift whenever a panel is added. The registry hands out a [`PanelKey`] the
//! first time a container node is observed and keeps returning it for that
//! node, so the rest of the engine can refer to "the panel I extracted
//! earlier" without index drift.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document::NodeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PanelKey(pub u64);

impl fmt::Display for PanelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct PanelRegistry {
    next: u64,
    keys: HashMap<NodeRef, PanelKey>,
    nodes: HashMap<PanelKey, NodeRef>,
    processed: HashSet<PanelKey>,
}

impl PanelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for `node`, assigning a fresh one on first observation
    pub fn key_for(&mut self, node: NodeRef) -> PanelKey {
        if let Some(key) = self.keys.get(&node) {
            return *key;
        }
        self.next += 1;
        let key = PanelKey(self.next);
        self.keys.insert(node, key);
        self.nodes.insert(key, node);
        key
    }

    pub fn lookup(&self, node: NodeRef) -> Option<PanelKey> {
        self.keys.get(&node).copied()
    }

    /// Container node a key was assigned to
    pub fn node_for(&self, key: PanelKey) -> Option<NodeRef> {
        self.nodes.get(&key).copied()
    }

    /// Drop the key of a container that left the document. The key is never
    /// handed out again.
    pub fn forget(&mut self, node: NodeRef) -> Option<PanelKey> {
        let key = self.keys.remove(&node)?;
        self.nodes.remove(&key);
        self.processed.remove(&key);
        Some(key)
    }

    /// Record that `key` has a sub-panel in the replacement UI. Returns
    /// `false` if it already had one.
    pub fn mark_processed(&mut self, key: PanelKey) -> bool {
        self.processed.insert(key)
    }

    pub fn is_processed(&self, key: PanelKey) -> bool {
        self.processed.contains(&key)
    }

    /// Forget which panels have sub-panels; keys stay assigned
    pub fn clear_processed(&mut self) {
        self.processed.clear();
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
