// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use crate::stream::StreamTarget;
use crate::version::NodeId;
use std::collections::BTreeMap;

/// Subscribed nodes of one master, reference counted per node.
///
/// Several slave instances on one node share a single subscription: live
/// data goes once per node addressed to all instances.
#[derive(Debug, Default, Clone)]
pub struct SlaveSet {
    nodes: BTreeMap<NodeId, u32>,
}

impl SlaveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more subscribed instance on `node`. True if the node is new.
    pub fn add(&mut self, node: &NodeId) -> bool {
        let count = self.nodes.entry(node.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop one instance on `node`. True if that was its last one.
    pub fn remove(&mut self, node: &NodeId) -> bool {
        match self.nodes.get_mut(node) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.nodes.remove(node);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn instances_on(&self, node: &NodeId) -> u32 {
        self.nodes.get(node).copied().unwrap_or(0)
    }

    /// Distinct subscribed nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// One broadcast target per subscribed node.
    pub fn targets(&self) -> Vec<StreamTarget> {
        self.nodes.keys().cloned().map(StreamTarget::all_on).collect()
    }
}
