// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The operator graph the elimination pass works on.
//!
//! [`NNGraph`] is a thin layer over a petgraph `StableGraph`: stable node
//! indices survive the structural rewrites the pass commits, and edges carry
//! the source and destination port so multi-input operators know which
//! operand an edge feeds.

use crate::errors::Error;
use crate::shape::Shape;
use indexmap::IndexMap;
use itertools::Itertools;
use petgraph::graph::IndexType;
use petgraph::prelude::*;
use petgraph::stable_graph::StableDiGraph;
use std::collections::HashMap;
use std::fmt;

mod build;
mod dimensions;
mod execute;
mod node;

pub use build::GraphBuilder;
pub use node::*;

/// Index for NNGraph. Used for newtype wrapping.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeIx(u32);

impl fmt::Display for NodeIx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// From the docs for `IndexType`:
//
// > Marked `unsafe` because: the trait must faithfully preserve and convert
// > index values.
unsafe impl IndexType for NodeIx {
    #[inline(always)]
    fn new(x: usize) -> Self {
        NodeIx(x as u32)
    }
    #[inline(always)]
    fn index(&self) -> usize {
        self.0 as usize
    }
    #[inline(always)]
    fn max() -> Self {
        NodeIx(u32::MAX)
    }
}

/// A reference to a node of an [`NNGraph`].
pub type NodeRef = NodeIndex<NodeIx>;

/// A directed, port-labelled connection between two nodes.
///
/// Edges are plain snapshots: the explorers capture them during a read-only
/// walk and actions re-resolve them against the live graph when they run.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Edge {
    /// Producing node.
    pub from: NodeRef,
    /// Output port on the producing node.
    pub from_port: usize,
    /// Consuming node.
    pub to: NodeRef,
    /// Input port on the consuming node.
    pub to_port: usize,
}

/// Edge payload stored in the underlying petgraph graph.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct EdgeData {
    from_port: usize,
    to_port: usize,
}

/// A node of the graph: operator kind plus inferred dimensions.
#[derive(Clone, Debug)]
pub struct NodeData {
    /// Unique node name. Iteration orders are tied to names, never to
    /// insertion order, so rewrites stay deterministic.
    pub name: String,
    /// The operator and its attributes.
    pub op: Op,
    /// Inferred shape per input port.
    pub in_dims: Vec<Shape>,
    /// Inferred shape per output port.
    pub out_dims: Vec<Shape>,
    /// Topological step index, reassigned by shape inference.
    pub step_idx: usize,
}

/// Key of the quantization side-table: node names survive index reuse.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new id from a node name.
    pub fn new(name: impl Into<String>) -> Self {
        NodeId(name.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric metadata shadowing a quantized node.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantRecord {
    /// Input scale.
    pub in_scale: f32,
    /// Output scale.
    pub out_scale: f32,
    /// Per-output-channel scales, when the node is per-channel quantized.
    pub channel_scales: Option<Vec<f32>>,
}

/// A graph of tensor operators and the data edges between them.
#[derive(Clone, Debug, Default)]
pub struct NNGraph {
    graph: StableDiGraph<NodeData, EdgeData, NodeIx>,
    names: HashMap<String, NodeRef>,
    /// Quantization records shadowing nodes with numeric metadata.
    pub quantization: IndexMap<NodeId, QuantRecord>,
}

impl NNGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node. Fails if the name is already taken.
    pub fn add_node(&mut self, name: impl Into<String>, op: Op) -> Result<NodeRef, Error> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(Error::InvalidGraph(format!(
                "duplicate node name '{}'",
                name
            )));
        }
        let node = self.graph.add_node(NodeData {
            name: name.clone(),
            op,
            in_dims: Vec::new(),
            out_dims: Vec::new(),
            step_idx: 0,
        });
        self.names.insert(name, node);
        Ok(node)
    }

    /// Connects two nodes through the given ports.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), Error> {
        if !self.graph.contains_node(edge.from) || !self.graph.contains_node(edge.to) {
            return Err(Error::InvalidGraph(
                "edge references a node that is not in the graph".to_string(),
            ));
        }
        self.graph.add_edge(
            edge.from,
            edge.to,
            EdgeData {
                from_port: edge.from_port,
                to_port: edge.to_port,
            },
        );
        Ok(())
    }

    /// Removes the given edge. Fails if it is not present.
    pub fn remove_edge(&mut self, edge: Edge) -> Result<(), Error> {
        let found = self
            .graph
            .edges_directed(edge.from, Outgoing)
            .find(|e| {
                e.target() == edge.to
                    && e.weight().from_port == edge.from_port
                    && e.weight().to_port == edge.to_port
            })
            .map(|e| e.id());
        match found {
            Some(id) => {
                self.graph.remove_edge(id);
                Ok(())
            }
            None => Err(Error::InvalidGraph(format!(
                "edge {} -> {} not in graph",
                self.node(edge.from).name,
                self.node(edge.to).name
            ))),
        }
    }

    /// Returns the node data for a reference.
    pub fn node(&self, node: NodeRef) -> &NodeData {
        &self.graph[node]
    }

    /// Mutable access to a node's data.
    pub fn node_mut(&mut self, node: NodeRef) -> &mut NodeData {
        &mut self.graph[node]
    }

    /// Returns true if the node is still part of the graph.
    pub fn contains(&self, node: NodeRef) -> bool {
        self.graph.contains_node(node)
    }

    /// Looks a node up by name.
    pub fn node_by_name(&self, name: &str) -> Option<NodeRef> {
        self.names.get(name).copied()
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// All nodes, sorted by name.
    pub fn nodes(&self) -> Vec<NodeRef> {
        self.graph
            .node_indices()
            .sorted_by(|a, b| self.graph[*a].name.cmp(&self.graph[*b].name))
            .collect()
    }

    /// All nodes matching a predicate on the operator, sorted by name.
    pub fn nodes_filtered(&self, filter: impl Fn(&Op) -> bool) -> Vec<NodeRef> {
        self.graph
            .node_indices()
            .filter(|&n| filter(&self.graph[n].op))
            .sorted_by(|a, b| self.graph[*a].name.cmp(&self.graph[*b].name))
            .collect()
    }

    /// Number of transpose nodes currently in the graph.
    pub fn transpose_count(&self) -> usize {
        self.graph
            .node_indices()
            .filter(|&n| matches!(self.graph[n].op, Op::Transpose { .. }))
            .count()
    }

    /// Incoming edges of a node, sorted by destination port.
    pub fn in_edges(&self, node: NodeRef) -> Vec<Edge> {
        self.graph
            .edges_directed(node, Incoming)
            .map(|e| Edge {
                from: e.source(),
                from_port: e.weight().from_port,
                to: node,
                to_port: e.weight().to_port,
            })
            .sorted_by(|a, b| {
                (a.to_port, &self.graph[a.from].name, a.from_port)
                    .cmp(&(b.to_port, &self.graph[b.from].name, b.from_port))
            })
            .collect()
    }

    /// Outgoing edges of a node, sorted by source port then consumer name.
    pub fn out_edges(&self, node: NodeRef) -> Vec<Edge> {
        self.graph
            .edges_directed(node, Outgoing)
            .map(|e| Edge {
                from: node,
                from_port: e.weight().from_port,
                to: e.target(),
                to_port: e.weight().to_port,
            })
            .sorted_by(|a, b| {
                (a.from_port, &self.graph[a.to].name, a.to_port)
                    .cmp(&(b.from_port, &self.graph[b.to].name, b.to_port))
            })
            .collect()
    }

    /// Incoming edges indexed by destination port. Input ports are dense, so
    /// entry `i` is the edge feeding port `i`.
    pub fn indexed_in_edges(&self, node: NodeRef) -> Vec<Edge> {
        let edges = self.in_edges(node);
        debug_assert!(
            edges.iter().enumerate().all(|(i, e)| e.to_port == i),
            "input ports of '{}' are not dense",
            self.graph[node].name
        );
        edges
    }

    /// Generates a fresh node name from a base.
    pub fn fresh_name(&self, base: &str) -> String {
        if !self.names.contains_key(base) {
            return base.to_string();
        }
        let mut counter = 1;
        loop {
            let candidate = format!("{}_{}", base, counter);
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Removes a node, reconnecting its single input to all of its consumers.
    pub fn remove_and_reconnect(&mut self, node: NodeRef) -> Result<(), Error> {
        let in_edges = self.in_edges(node);
        let in_edge = match in_edges.first() {
            Some(edge) => *edge,
            None => {
                return Err(Error::InvalidGraph(format!(
                    "cannot reconnect '{}': it has no input",
                    self.node(node).name
                )))
            }
        };
        let out_edges = self.out_edges(node);
        self.remove_node(node);
        for out in out_edges {
            self.add_edge(Edge {
                from: in_edge.from,
                from_port: in_edge.from_port,
                to: out.to,
                to_port: out.to_port,
            })?;
        }
        Ok(())
    }

    /// Removes a node and all of its edges.
    pub fn remove_node(&mut self, node: NodeRef) {
        if let Some(data) = self.graph.remove_node(node) {
            self.names.remove(&data.name);
        }
    }

    /// Splices a node (receiving on port 0, producing on port 0) onto an
    /// existing edge.
    pub fn insert_on_edge(&mut self, edge: Edge, node: NodeRef) -> Result<(), Error> {
        self.remove_edge(edge)?;
        self.add_edge(Edge {
            from: edge.from,
            from_port: edge.from_port,
            to: node,
            to_port: 0,
        })?;
        self.add_edge(Edge {
            from: node,
            from_port: 0,
            to: edge.to,
            to_port: edge.to_port,
        })
    }
}
