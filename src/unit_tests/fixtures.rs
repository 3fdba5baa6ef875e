// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared helpers for building test graphs and tensors.

use crate::graph::NNGraph;
use crate::shape::Shape;
use ndarray::{ArrayD, IxDyn};

/// A tensor holding `0.0, 1.0, 2.0, ...` in row-major order. Handy when a
/// test needs to see exactly where each element went.
pub(crate) fn seq_array(dims: &[usize]) -> ArrayD<f32> {
    let len: usize = dims.iter().product();
    ArrayD::from_shape_vec(IxDyn(dims), (0..len).map(|i| i as f32).collect())
        .expect("length matches shape")
}

/// A deterministic tensor of varied values, for weights and inputs where
/// repeated values could mask a permutation bug.
pub(crate) fn varied_array(dims: &[usize], seed: u32) -> ArrayD<f32> {
    let len: usize = dims.iter().product();
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    let values = (0..len)
        .map(|_| {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            ((state >> 16) % 1000) as f32 / 100.0 - 5.0
        })
        .collect();
    ArrayD::from_shape_vec(IxDyn(dims), values).expect("length matches shape")
}

/// A structural snapshot for determinism and fixpoint comparisons: node
/// names, operator kinds, and inferred output shapes, in name order.
pub(crate) fn snapshot(graph: &NNGraph) -> Vec<(String, &'static str, Vec<Shape>)> {
    graph
        .nodes()
        .into_iter()
        .map(|node| {
            let data = graph.node(node);
            (data.name.clone(), data.op.kind_name(), data.out_dims.clone())
        })
        .collect()
}
