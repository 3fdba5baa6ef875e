// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A straight-line reference evaluator.
//!
//! The evaluator interprets the graph numerically, one node at a time in
//! topological order. It exists to pin down operator semantics and to serve
//! as the oracle for the pass's semantic-equivalence guarantee; it makes no
//! attempt at being fast.

use crate::errors::Error;
use crate::graph::{ActivationKind, BinaryOp, LinearAttrs, NNGraph, Op, PoolingKind, UnaryOp};
use crate::shape::Shape;
use ndarray::{Axis, IxDyn, Slice, Zip};
use ndarray::{ArrayD, ArrayViewD};
use petgraph::algo::toposort;
use std::collections::HashMap;

impl NNGraph {
    /// Runs the graph on the given inputs.
    ///
    /// Inputs are matched to `Input` nodes in name order; outputs are the
    /// values arriving at `Output` nodes, in name order.
    pub fn execute(&self, inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>, Error> {
        let order = toposort(&self.graph, None)
            .map_err(|_| Error::Execution("graph contains a cycle".to_string()))?;

        let input_nodes = self.nodes_filtered(|op| matches!(op, Op::Input { .. }));
        if input_nodes.len() != inputs.len() {
            return Err(Error::Execution(format!(
                "expected {} inputs, got {}",
                input_nodes.len(),
                inputs.len()
            )));
        }
        let mut fed: HashMap<_, _> = input_nodes.iter().copied().zip(inputs.iter()).collect();

        let mut values: HashMap<(_, usize), ArrayD<f32>> = HashMap::new();
        for node in order {
            let data = self.node(node);
            let operands: Vec<ArrayD<f32>> = self
                .indexed_in_edges(node)
                .iter()
                .map(|e| {
                    values.get(&(e.from, e.from_port)).cloned().ok_or_else(|| {
                        Error::Execution(format!("missing value feeding '{}'", data.name))
                    })
                })
                .collect::<Result<_, _>>()?;
            let fail = |msg: String| Error::Execution(format!("'{}': {}", data.name, msg));

            let value = match &data.op {
                Op::Input { shape, .. } => {
                    let value = fed
                        .remove(&node)
                        .ok_or_else(|| fail("no value fed for input".to_string()))?;
                    if value.shape() != shape.dims() {
                        return Err(fail(format!(
                            "fed value has shape {:?}, declared {}",
                            value.shape(),
                            shape
                        )));
                    }
                    value.clone()
                }
                Op::Constant { value } => value.clone(),
                Op::Output { .. } => operands[0].clone(),
                Op::Transpose { perm } => operands[0]
                    .view()
                    .permuted_axes(perm.axes())
                    .to_owned(),
                Op::Reshape { shape, .. } => reshape_to(&operands[0], shape)?,
                Op::Pad { padding } => {
                    let input = &operands[0];
                    let out_dims: Vec<usize> = input
                        .shape()
                        .iter()
                        .zip(padding)
                        .map(|(&d, &(b, a))| d + b + a)
                        .collect();
                    let mut out = ArrayD::<f32>::zeros(IxDyn(&out_dims));
                    let mut window = out.view_mut();
                    for (axis, (&dim, &(before, _))) in
                        input.shape().iter().zip(padding).enumerate()
                    {
                        window.slice_axis_inplace(
                            Axis(axis),
                            Slice::new(before as isize, Some((before + dim) as isize), 1),
                        );
                    }
                    window.assign(input);
                    out
                }
                Op::Reverse { axis } => {
                    let mut view = operands[0].view();
                    view.invert_axis(Axis(*axis));
                    view.to_owned()
                }
                Op::StridedSlice {
                    specs, out_shape, ..
                } => {
                    let mut view = operands[0].view();
                    for (axis, spec) in specs.iter().enumerate() {
                        view.slice_axis_inplace(
                            Axis(axis),
                            Slice::new(
                                spec.begin as isize,
                                Some(spec.end as isize),
                                spec.stride as isize,
                            ),
                        );
                    }
                    reshape_to(&view.to_owned(), out_shape)?
                }
                Op::Concat { axis } => {
                    let views: Vec<ArrayViewD<'_, f32>> =
                        operands.iter().map(|a| a.view()).collect();
                    ndarray::concatenate(Axis(*axis), &views)
                        .map_err(|err| fail(format!("concat failed: {}", err)))?
                }
                Op::Binary { op } => {
                    let (a, b) = broadcast_pair(&operands[0], &operands[1])
                        .ok_or_else(|| fail("operands do not broadcast".to_string()))?;
                    match op {
                        BinaryOp::Add => &a + &b,
                        BinaryOp::Sub => &a - &b,
                        BinaryOp::Mul => &a * &b,
                        BinaryOp::Div => &a / &b,
                    }
                }
                Op::Pow => {
                    let (a, b) = broadcast_pair(&operands[0], &operands[1])
                        .ok_or_else(|| fail("operands do not broadcast".to_string()))?;
                    Zip::from(&a).and(&b).map_collect(|&x, &y| x.powf(y))
                }
                Op::Activation { kind } => apply_activation(&operands[0], *kind),
                Op::Copy => operands[0].clone(),
                Op::Unary { op } => match op {
                    UnaryOp::Neg => operands[0].mapv(|x| -x),
                    UnaryOp::Abs => operands[0].mapv(f32::abs),
                },
                Op::Softmax { axis } => {
                    let mut out = operands[0].clone();
                    for mut lane in out.lanes_mut(Axis(*axis)) {
                        let max = lane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                        lane.mapv_inplace(|x| (x - max).exp());
                        let sum: f32 = lane.iter().sum();
                        lane.mapv_inplace(|x| x / sum);
                    }
                    out
                }
                Op::Conv {
                    weights,
                    stride,
                    padding,
                } => eval_conv(&operands[0], weights, *stride, *padding),
                Op::GlobalPooling { kind } => {
                    let input = &operands[0];
                    let rank = input.ndim();
                    let mut out = input.clone();
                    for axis in (2..rank).rev() {
                        out = match kind {
                            PoolingKind::Mean => out.mean_axis(Axis(axis)).ok_or_else(|| {
                                fail("cannot pool an empty axis".to_string())
                            })?,
                            PoolingKind::Max => {
                                out.map_axis(Axis(axis), |lane| {
                                    lane.iter().copied().fold(f32::NEG_INFINITY, f32::max)
                                })
                            }
                        };
                    }
                    let dims: Vec<usize> = (0..rank)
                        .map(|i| if i < 2 { input.shape()[i] } else { 1 })
                        .collect();
                    reshape_to(&out, &Shape::new(dims))?
                }
                Op::FullyConnected { linear } => eval_linear(&operands[0], linear),
                Op::LinearFusion { linear, activation } => {
                    apply_activation(&eval_linear(&operands[0], linear), *activation)
                }
            };
            values.insert((node, 0), value);
        }

        let mut outputs = Vec::new();
        for node in self.nodes_filtered(|op| matches!(op, Op::Output { .. })) {
            outputs.push(
                values
                    .get(&(node, 0))
                    .cloned()
                    .ok_or_else(|| Error::Execution("output was never computed".to_string()))?,
            );
        }
        Ok(outputs)
    }
}

fn reshape_to(value: &ArrayD<f32>, shape: &Shape) -> Result<ArrayD<f32>, Error> {
    value
        .as_standard_layout()
        .to_owned()
        .into_shape(IxDyn(shape.dims()))
        .map_err(|err| Error::Execution(format!("reshape to {} failed: {}", shape, err)))
}

fn broadcast_pair<'a>(
    a: &'a ArrayD<f32>,
    b: &'a ArrayD<f32>,
) -> Option<(ArrayViewD<'a, f32>, ArrayViewD<'a, f32>)> {
    let rank = a.ndim().max(b.ndim());
    let dims: Vec<usize> = (0..rank)
        .map(|i| {
            let da = aligned_dim(a.shape(), rank, i);
            let db = aligned_dim(b.shape(), rank, i);
            da.max(db)
        })
        .collect();
    let av = a.broadcast(IxDyn(&dims))?;
    let bv = b.broadcast(IxDyn(&dims))?;
    Some((av, bv))
}

fn aligned_dim(shape: &[usize], rank: usize, i: usize) -> usize {
    let skew = rank - shape.len();
    if i < skew {
        1
    } else {
        shape[i - skew]
    }
}

fn apply_activation(value: &ArrayD<f32>, kind: ActivationKind) -> ArrayD<f32> {
    match kind {
        ActivationKind::Relu => value.mapv(|x| x.max(0.0)),
        ActivationKind::Sigmoid => value.mapv(|x| 1.0 / (1.0 + (-x).exp())),
        ActivationKind::Tanh => value.mapv(f32::tanh),
    }
}

fn eval_linear(input: &ArrayD<f32>, linear: &LinearAttrs) -> ArrayD<f32> {
    let batch = linear.batch_size;
    let in_features = linear.in_features();
    let out_features = linear.out_features();
    let flat: Vec<f32> = input.iter().copied().collect();
    let mut result = vec![0.0f32; batch * out_features];
    for b in 0..batch {
        for o in 0..out_features {
            let mut acc = linear.bias.as_ref().map_or(0.0, |bias| bias[o]);
            for i in 0..in_features {
                acc += linear.weights[[o, i]] * flat[b * in_features + i];
            }
            if linear.batch_minor && batch > 1 {
                result[o * batch + b] = acc;
            } else {
                result[b * out_features + o] = acc;
            }
        }
    }
    let dims: Vec<usize> = if batch > 1 {
        if linear.batch_minor {
            vec![out_features, batch]
        } else {
            vec![batch, out_features]
        }
    } else {
        vec![out_features]
    };
    ArrayD::from_shape_vec(IxDyn(&dims), result).expect("result length matches shape")
}

fn eval_conv(
    input: &ArrayD<f32>,
    weights: &ArrayD<f32>,
    stride: (usize, usize),
    padding: (usize, usize),
) -> ArrayD<f32> {
    let (n, in_c, h, w) = (
        input.shape()[0],
        input.shape()[1],
        input.shape()[2],
        input.shape()[3],
    );
    let (out_c, kh, kw) = (weights.shape()[0], weights.shape()[2], weights.shape()[3]);
    let out_h = (h + 2 * padding.0 - kh) / stride.0 + 1;
    let out_w = (w + 2 * padding.1 - kw) / stride.1 + 1;
    let mut out = ArrayD::<f32>::zeros(IxDyn(&[n, out_c, out_h, out_w]));
    for b in 0..n {
        for oc in 0..out_c {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = 0.0;
                    for ic in 0..in_c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = oy * stride.0 + ky;
                                let ix = ox * stride.1 + kx;
                                if iy < padding.0 || ix < padding.1 {
                                    continue;
                                }
                                let (iy, ix) = (iy - padding.0, ix - padding.1);
                                if iy >= h || ix >= w {
                                    continue;
                                }
                                acc += input[[b, ic, iy, ix]] * weights[[oc, ic, ky, kx]];
                            }
                        }
                    }
                    out[[b, oc, oy, ox]] = acc;
                }
            }
        }
    }
    out
}
