// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shape inference. `add_dimensions` re-derives every node's input and
//! output dimensions from the graph inputs and node attributes, and assigns
//! topological step indices. It runs after every committed batch of rewrite
//! actions.

use crate::errors::Error;
use crate::graph::{NNGraph, NodeRef, Op};
use crate::shape::Shape;
use petgraph::algo::toposort;

impl NNGraph {
    /// Recomputes `in_dims`, `out_dims` and `step_idx` for every node.
    pub fn add_dimensions(&mut self) -> Result<(), Error> {
        let order = toposort(&self.graph, None)
            .map_err(|_| Error::ShapeInference("graph contains a cycle".to_string()))?;
        for (step, &node) in order.iter().enumerate() {
            let in_edges = self.indexed_in_edges(node);
            let in_dims: Vec<Shape> = in_edges
                .iter()
                .map(|e| {
                    self.node(e.from)
                        .out_dims
                        .get(e.from_port)
                        .cloned()
                        .ok_or_else(|| {
                            Error::ShapeInference(format!(
                                "'{}' consumes missing output port {} of '{}'",
                                self.node(node).name,
                                e.from_port,
                                self.node(e.from).name
                            ))
                        })
                })
                .collect::<Result<_, _>>()?;
            let out_dims = self.infer_node(node, &in_dims)?;
            let data = self.node_mut(node);
            data.in_dims = in_dims;
            data.out_dims = out_dims;
            data.step_idx = step;
        }
        Ok(())
    }

    fn infer_node(&self, node: NodeRef, in_dims: &[Shape]) -> Result<Vec<Shape>, Error> {
        let data = self.node(node);
        let fail = |msg: String| Error::ShapeInference(format!("'{}': {}", data.name, msg));
        let single = || {
            in_dims
                .first()
                .cloned()
                .ok_or_else(|| fail("missing input".to_string()))
        };
        let out = match &data.op {
            Op::Input { shape, .. } => shape.clone(),
            Op::Constant { value } => Shape::new(value.shape().iter().copied()),
            Op::Output { .. } => single()?,
            Op::Transpose { perm } => {
                let input = single()?;
                if perm.rank() != input.rank() {
                    return Err(fail(format!(
                        "permutation {} does not match rank of {}",
                        perm, input
                    )));
                }
                perm.apply(&input)
            }
            Op::Reshape { shape, .. } => {
                let input = single()?;
                if input.num_elements() != shape.num_elements() {
                    return Err(fail(format!(
                        "cannot reshape {} into {}",
                        input, shape
                    )));
                }
                shape.clone()
            }
            Op::Pad { padding } => {
                let input = single()?;
                if padding.len() != input.rank() {
                    return Err(fail("padding rank mismatch".to_string()));
                }
                Shape::new(
                    input
                        .dims()
                        .iter()
                        .zip(padding)
                        .map(|(&d, &(before, after))| d + before + after),
                )
            }
            Op::Reverse { axis } => {
                let input = single()?;
                if *axis >= input.rank() {
                    return Err(fail(format!("reverse axis {} out of range", axis)));
                }
                input
            }
            Op::StridedSlice {
                specs,
                slice_shape,
                out_shape,
            } => {
                let input = single()?;
                if specs.len() != input.rank() {
                    return Err(fail("slice rank mismatch".to_string()));
                }
                for (spec, &dim) in specs.iter().zip(input.dims()) {
                    if spec.end > dim {
                        return Err(fail(format!("slice end {} exceeds dim {}", spec.end, dim)));
                    }
                }
                let computed = Shape::new(specs.iter().map(|s| s.len()));
                if &computed != slice_shape {
                    return Err(fail(format!(
                        "slice shape {} does not match specs ({})",
                        slice_shape, computed
                    )));
                }
                if out_shape.num_elements() != computed.num_elements() {
                    return Err(fail(format!(
                        "cannot reshape sliced {} into {}",
                        computed, out_shape
                    )));
                }
                out_shape.clone()
            }
            Op::Concat { axis } => {
                let first = single()?;
                if *axis >= first.rank() {
                    return Err(fail(format!("concat axis {} out of range", axis)));
                }
                let mut dims: Vec<usize> = first.dims().to_vec();
                for shape in &in_dims[1..] {
                    if shape.rank() != first.rank() {
                        return Err(fail("concat inputs must have the same rank".to_string()));
                    }
                    for (i, (&a, &b)) in first.dims().iter().zip(shape.dims()).enumerate() {
                        if i != *axis && a != b {
                            return Err(fail(format!(
                                "concat inputs disagree on axis {}: {} vs {}",
                                i, a, b
                            )));
                        }
                    }
                    dims[*axis] += shape[*axis];
                }
                Shape::new(dims)
            }
            Op::Binary { .. } | Op::Pow => {
                if in_dims.len() != 2 {
                    return Err(fail("expected exactly two inputs".to_string()));
                }
                broadcast_shape(&in_dims[0], &in_dims[1]).ok_or_else(|| {
                    fail(format!(
                        "cannot broadcast {} against {}",
                        in_dims[0], in_dims[1]
                    ))
                })?
            }
            Op::Activation { .. } | Op::Copy | Op::Unary { .. } => single()?,
            Op::Softmax { axis } => {
                let input = single()?;
                if *axis >= input.rank() {
                    return Err(fail(format!("softmax axis {} out of range", axis)));
                }
                input
            }
            Op::Conv {
                weights,
                stride,
                padding,
            } => {
                let input = single()?;
                if input.rank() != 4 || weights.ndim() != 4 {
                    return Err(fail("conv expects NCHW input and OIHW weights".to_string()));
                }
                let (kh, kw) = (weights.shape()[2], weights.shape()[3]);
                if weights.shape()[1] != input[1] {
                    return Err(fail(format!(
                        "conv input channels {} do not match weights {}",
                        input[1],
                        weights.shape()[1]
                    )));
                }
                let padded_h = input[2] + 2 * padding.0;
                let padded_w = input[3] + 2 * padding.1;
                if padded_h < kh || padded_w < kw {
                    return Err(fail("conv kernel larger than padded input".to_string()));
                }
                Shape::new([
                    input[0],
                    weights.shape()[0],
                    (padded_h - kh) / stride.0 + 1,
                    (padded_w - kw) / stride.1 + 1,
                ])
            }
            Op::GlobalPooling { .. } => {
                let input = single()?;
                if input.rank() < 3 {
                    return Err(fail("global pooling expects at least rank 3".to_string()));
                }
                Shape::new(
                    input
                        .dims()
                        .iter()
                        .enumerate()
                        .map(|(i, &d)| if i < 2 { d } else { 1 }),
                )
            }
            Op::FullyConnected { linear } | Op::LinearFusion { linear, .. } => {
                let input = single()?;
                let expected = linear.batch_size * linear.in_features();
                if input.num_elements() != expected {
                    return Err(fail(format!(
                        "linear expects {} elements, input {} has {}",
                        expected,
                        input,
                        input.num_elements()
                    )));
                }
                if linear.batch_size > 1 {
                    if linear.batch_minor {
                        Shape::new([linear.out_features(), linear.batch_size])
                    } else {
                        Shape::new([linear.batch_size, linear.out_features()])
                    }
                } else {
                    Shape::new([linear.out_features()])
                }
            }
        };
        Ok(vec![out])
    }
}

/// Numpy-style broadcast of two shapes: ranks are aligned by prepending unit
/// axes, then each axis pair must agree or contain a 1.
fn broadcast_shape(a: &Shape, b: &Shape) -> Option<Shape> {
    let rank = a.rank().max(b.rank());
    let dim_at = |shape: &Shape, i: usize| {
        let skew = rank - shape.rank();
        if i < skew {
            1
        } else {
            shape[i - skew]
        }
    };
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let (da, db) = (dim_at(a, i), dim_at(b, i));
        if da != db && da != 1 && db != 1 {
            return None;
        }
        dims.push(da.max(db));
    }
    Some(Shape::new(dims))
}
