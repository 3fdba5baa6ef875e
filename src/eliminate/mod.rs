// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The transpose elimination pass.
//!
//! [`eliminate_transposes`] walks the graph looking for transpose nodes that
//! can be deleted, absorbed into layout-flexible neighbours (constants,
//! inputs, linear layers, other transposes) or pushed along the graph until
//! an order-sensitive operator stops them. See the crate docs for the
//! overall approach.

use crate::graph::{NNGraph, NodeRef};
use crate::shape::{Perm, Shape};
use indexmap::IndexSet;
use std::fmt;

mod actions;
pub(crate) mod driver;
pub(crate) mod reshape_math;
mod search_down;
mod search_up;
mod visited;

pub use driver::{eliminate_transposes, EliminateOptions};

use visited::{VisitTag, VisitedNodes};

/// Branch-local, recoverable failure: this exploration path is infeasible.
///
/// Raised with a short reason and caught at the nearest boundary that has a
/// fallback (the ambiguous-reshape retry, or the driver's per-direction
/// attempt). Never surfaces through the public API.
#[derive(Clone, Debug)]
pub(crate) struct CantContinue {
    reason: String,
}

impl CantContinue {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CantContinue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

/// One record of how the propagated permutation changed at a reshape or
/// shape-changing slice along the path.
#[derive(Clone, Debug)]
pub(crate) struct TransposeHistory {
    /// The node at which the rewrite happened.
    #[allow(dead_code)]
    pub(crate) node: NodeRef,
    /// The shape on the side the permutation arrived on.
    pub(crate) from_shape: Shape,
    /// The permutation after the rewrite; `None` once a rank-1 reshape has
    /// made it ambiguous.
    pub(crate) transpose: Option<Perm>,
    /// The shape on the side the permutation continues on.
    pub(crate) to_shape: Shape,
}

impl TransposeHistory {
    pub(crate) fn new(
        node: NodeRef,
        from_shape: Shape,
        transpose: Option<Perm>,
        to_shape: Shape,
    ) -> Self {
        Self {
            node,
            from_shape,
            transpose,
            to_shape,
        }
    }
}

/// The permutation currently being propagated: the last history entry's.
pub(crate) fn current_transpose(history: &[TransposeHistory]) -> Option<&Perm> {
    history.last().and_then(|entry| entry.transpose.as_ref())
}

/// Fails the frontier when the propagated permutation has become ambiguous
/// and the node at hand cannot tolerate that.
pub(crate) fn require_perm<'a>(
    graph: &NNGraph,
    node: NodeRef,
    transpose: &'a Option<Perm>,
) -> Result<&'a Perm, CantContinue> {
    transpose.as_ref().ok_or_else(|| {
        CantContinue::new(format!("can't continue at {}", graph.node(node).name))
    })
}

/// Decides whether to visit a node reached through an edge.
///
/// Returns `Ok(true)` to skip (the node was already handled), `Ok(false)` to
/// visit, and fails the frontier when the same direction and port would be
/// entered twice or the node belongs to a previous elimination.
pub(crate) fn check_continue(
    graph: &NNGraph,
    visited: &VisitedNodes,
    cur_visited: &VisitedNodes,
    exclude: &IndexSet<NodeRef>,
    node: NodeRef,
    tag: VisitTag,
) -> Result<bool, CantContinue> {
    // An order-sensitive node must be visited from both directions, since
    // each side may need its own reshape or transpose inserted after it. A
    // layout-flexible terminal likewise stays visitable from either side.
    let op = &graph.node(node).op;
    if !op.is_sensitive_to_order() && !op.is_layout_flexible() {
        let other_direction_done = match tag {
            VisitTag::Up(_) => visited.visited_down(node) || cur_visited.visited_down(node),
            VisitTag::Down(_) => visited.visited_up(node) || cur_visited.visited_up(node),
        };
        if other_direction_done {
            return Ok(true);
        }
    }
    if visited.visited_exact(node, tag) || cur_visited.visited_exact(node, tag) {
        return Err(CantContinue::new(format!(
            "{} already visited on this frontier",
            graph.node(node).name
        )));
    }
    if exclude.contains(&node) {
        return Err(CantContinue::new(format!(
            "{} was claimed by a previous elimination",
            graph.node(node).name
        )));
    }
    Ok(false)
}
