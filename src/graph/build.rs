// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Graph construction. Model importers (and the test suite) build graphs
//! through [`GraphBuilder`], which validates the structure and runs shape
//! inference once the graph is complete.

use crate::errors::Error;
use crate::graph::{
    ActivationKind, BinaryOp, Edge, LinearAttrs, NNGraph, NodeRef, Op, PoolingKind, SliceSpec,
    UnaryOp,
};
use crate::shape::{Perm, Shape};
use ndarray::ArrayD;

/// Incrementally builds an [`NNGraph`].
///
/// Node-adding methods return the new node's reference immediately so edges
/// can be wired as the graph is described. Errors are deferred: the first
/// error sticks and is reported by [`GraphBuilder::build`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: NNGraph,
    error: Option<Error>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, name: &str, op: Op) -> NodeRef {
        match self.graph.add_node(name, op) {
            Ok(node) => node,
            Err(err) => {
                if self.error.is_none() {
                    self.error = Some(err);
                }
                // Return a placeholder; build() will fail anyway.
                NodeRef::new(u32::MAX as usize - 1)
            }
        }
    }

    /// Adds a graph input.
    pub fn input(&mut self, name: &str, shape: impl Into<Shape>) -> NodeRef {
        self.add(
            name,
            Op::Input {
                shape: shape.into(),
                fixed_order: false,
            },
        )
    }

    /// Adds a graph input whose layout the pass may not reorder.
    pub fn fixed_input(&mut self, name: &str, shape: impl Into<Shape>) -> NodeRef {
        self.add(
            name,
            Op::Input {
                shape: shape.into(),
                fixed_order: true,
            },
        )
    }

    /// Adds a graph output.
    pub fn output(&mut self, name: &str) -> NodeRef {
        self.add(name, Op::Output { fixed_order: false })
    }

    /// Adds a graph output whose layout the pass may not reorder.
    pub fn fixed_output(&mut self, name: &str) -> NodeRef {
        self.add(name, Op::Output { fixed_order: true })
    }

    /// Adds a constant tensor.
    pub fn constant(&mut self, name: &str, value: ArrayD<f32>) -> NodeRef {
        self.add(name, Op::Constant { value })
    }

    /// Adds a transpose node.
    pub fn transpose(&mut self, name: &str, perm: impl Into<Perm>) -> NodeRef {
        self.add(name, Op::Transpose { perm: perm.into() })
    }

    /// Adds a reshape node.
    pub fn reshape(
        &mut self,
        name: &str,
        old_shape: impl Into<Shape>,
        shape: impl Into<Shape>,
    ) -> NodeRef {
        self.add(
            name,
            Op::Reshape {
                old_shape: old_shape.into(),
                shape: shape.into(),
            },
        )
    }

    /// Adds a zero-padding node.
    pub fn pad(&mut self, name: &str, padding: Vec<(usize, usize)>) -> NodeRef {
        self.add(name, Op::Pad { padding })
    }

    /// Adds an axis-reversal node.
    pub fn reverse(&mut self, name: &str, axis: usize) -> NodeRef {
        self.add(name, Op::Reverse { axis })
    }

    /// Adds a strided slice. `out_shape` defaults to the slice shape; pass a
    /// different one for a slice that also reshapes.
    pub fn strided_slice(
        &mut self,
        name: &str,
        specs: Vec<SliceSpec>,
        out_shape: Option<Shape>,
    ) -> NodeRef {
        let slice_shape = Shape::new(specs.iter().map(SliceSpec::len));
        let out_shape = out_shape.unwrap_or_else(|| slice_shape.clone());
        self.add(
            name,
            Op::StridedSlice {
                specs,
                slice_shape,
                out_shape,
            },
        )
    }

    /// Adds a concatenation node.
    pub fn concat(&mut self, name: &str, axis: usize) -> NodeRef {
        self.add(name, Op::Concat { axis })
    }

    /// Adds a binary arithmetic node.
    pub fn binary(&mut self, name: &str, op: BinaryOp) -> NodeRef {
        self.add(name, Op::Binary { op })
    }

    /// Adds an elementwise power node.
    pub fn pow(&mut self, name: &str) -> NodeRef {
        self.add(name, Op::Pow)
    }

    /// Adds an activation node.
    pub fn activation(&mut self, name: &str, kind: ActivationKind) -> NodeRef {
        self.add(name, Op::Activation { kind })
    }

    /// Adds an identity copy node.
    pub fn copy(&mut self, name: &str) -> NodeRef {
        self.add(name, Op::Copy)
    }

    /// Adds an elementwise unary node.
    pub fn unary(&mut self, name: &str, op: UnaryOp) -> NodeRef {
        self.add(name, Op::Unary { op })
    }

    /// Adds a softmax node.
    pub fn softmax(&mut self, name: &str, axis: usize) -> NodeRef {
        self.add(name, Op::Softmax { axis })
    }

    /// Adds a 2-d convolution node.
    pub fn conv(
        &mut self,
        name: &str,
        weights: ArrayD<f32>,
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> NodeRef {
        self.add(
            name,
            Op::Conv {
                weights,
                stride,
                padding,
            },
        )
    }

    /// Adds a global pooling node.
    pub fn global_pooling(&mut self, name: &str, kind: PoolingKind) -> NodeRef {
        self.add(name, Op::GlobalPooling { kind })
    }

    /// Adds a fully-connected layer.
    pub fn linear(
        &mut self,
        name: &str,
        weights: ArrayD<f32>,
        bias: Option<Vec<f32>>,
        batch_size: usize,
    ) -> NodeRef {
        self.add(
            name,
            Op::FullyConnected {
                linear: LinearAttrs {
                    weights,
                    bias,
                    batch_size,
                    batch_minor: false,
                },
            },
        )
    }

    /// Adds a fully-connected layer fused with an activation.
    pub fn linear_fusion(
        &mut self,
        name: &str,
        weights: ArrayD<f32>,
        bias: Option<Vec<f32>>,
        batch_size: usize,
        activation: ActivationKind,
    ) -> NodeRef {
        self.add(
            name,
            Op::LinearFusion {
                linear: LinearAttrs {
                    weights,
                    bias,
                    batch_size,
                    batch_minor: false,
                },
                activation,
            },
        )
    }

    /// Connects `from` port 0 to `to` port 0.
    pub fn edge(&mut self, from: NodeRef, to: NodeRef) {
        self.edge_ports(from, 0, to, 0);
    }

    /// Connects `from` port 0 to the given input port of `to`.
    pub fn edge_to_port(&mut self, from: NodeRef, to: NodeRef, to_port: usize) {
        self.edge_ports(from, 0, to, to_port);
    }

    /// Connects two nodes through explicit ports.
    pub fn edge_ports(&mut self, from: NodeRef, from_port: usize, to: NodeRef, to_port: usize) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.graph.add_edge(Edge {
            from,
            from_port,
            to,
            to_port,
        }) {
            self.error = Some(err);
        }
    }

    /// Validates the graph, runs shape inference, and returns it.
    pub fn build(self) -> Result<NNGraph, Error> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let mut graph = self.graph;
        for node in graph.nodes() {
            let data = graph.node(node);
            let has_input = !graph.in_edges(node).is_empty();
            let needs_input = !matches!(data.op, Op::Input { .. } | Op::Constant { .. });
            if needs_input && !has_input {
                return Err(Error::InvalidGraph(format!(
                    "node '{}' has no input",
                    data.name
                )));
            }
        }
        graph.add_dimensions()?;
        Ok(graph)
    }
}
