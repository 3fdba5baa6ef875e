// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-frontier visit bookkeeping.
//!
//! Every exploration carries a [`VisitedNodes`] recording, per node, the
//! direction and edge port through which it was entered. Re-entering a node
//! through the same direction and port aborts the frontier; meeting a node
//! the opposite frontier already handled short-circuits, except at
//! order-sensitive nodes which each side must negotiate independently.

use crate::graph::NodeRef;
use indexmap::IndexMap;
use std::collections::BTreeSet;

/// A single visit: the direction and entry port.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) enum VisitTag {
    /// Entered in data-flow direction through the given input port.
    Down(usize),
    /// Entered against data-flow through the given output port.
    Up(usize),
}

impl VisitTag {
    fn is_down(self) -> bool {
        matches!(self, VisitTag::Down(_))
    }
}

/// The set of nodes a frontier has claimed, with their visit tags.
#[derive(Clone, Debug, Default)]
pub(crate) struct VisitedNodes {
    nodes: IndexMap<NodeRef, BTreeSet<VisitTag>>,
}

impl VisitedNodes {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a visit in data-flow direction through input port `idx`.
    pub(crate) fn visit_down(&mut self, node: NodeRef, idx: usize) {
        self.nodes.entry(node).or_default().insert(VisitTag::Down(idx));
    }

    /// Records a visit against data-flow through output port `idx`.
    pub(crate) fn visit_up(&mut self, node: NodeRef, idx: usize) {
        self.nodes.entry(node).or_default().insert(VisitTag::Up(idx));
    }

    /// True if the node was entered downward through any port.
    pub(crate) fn visited_down(&self, node: NodeRef) -> bool {
        self.nodes
            .get(&node)
            .map_or(false, |tags| tags.iter().any(|t| t.is_down()))
    }

    /// True if the node was entered upward through any port.
    pub(crate) fn visited_up(&self, node: NodeRef) -> bool {
        self.nodes
            .get(&node)
            .map_or(false, |tags| tags.iter().any(|t| !t.is_down()))
    }

    /// True if this exact direction and port was already used.
    pub(crate) fn visited_exact(&self, node: NodeRef, tag: VisitTag) -> bool {
        self.nodes
            .get(&node)
            .map_or(false, |tags| tags.contains(&tag))
    }

    /// True if the node carries any tag.
    pub(crate) fn contains(&self, node: NodeRef) -> bool {
        self.nodes.get(&node).map_or(false, |tags| !tags.is_empty())
    }

    /// Merges another frontier's claims into this one.
    pub(crate) fn merge(&mut self, other: &VisitedNodes) {
        for (&node, tags) in &other.nodes {
            self.nodes.entry(node).or_default().extend(tags.iter().copied());
        }
    }

    /// Returns the union of two frontiers.
    pub(crate) fn union(&self, other: &VisitedNodes) -> VisitedNodes {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// The claimed nodes, in first-visit order.
    pub(crate) fn node_refs(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.nodes.keys().copied()
    }
}
