// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::fixtures::{seq_array, varied_array};
use crate::errors::Error;
use crate::graph::{BinaryOp, GraphBuilder, SliceSpec};
use crate::shape::Shape;
use ndarray::IxDyn;
use pretty_assertions::assert_eq;

#[test]
fn builder_infers_dimensions_and_steps() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [1, 3, 4, 5]);
    let transpose = builder.transpose("transpose", [0, 2, 3, 1]);
    let reshape = builder.reshape("reshape", [1, 4, 5, 3], [20, 3]);
    let output = builder.output("output");
    builder.edge(input, transpose);
    builder.edge(transpose, reshape);
    builder.edge(reshape, output);
    let graph = builder.build().unwrap();

    assert_eq!(graph.node(input).out_dims, vec![Shape::from([1, 3, 4, 5])]);
    assert_eq!(
        graph.node(transpose).out_dims,
        vec![Shape::from([1, 4, 5, 3])]
    );
    assert_eq!(graph.node(reshape).out_dims, vec![Shape::from([20, 3])]);
    assert_eq!(graph.node(output).out_dims, vec![Shape::from([20, 3])]);
    assert!(graph.node(input).step_idx < graph.node(transpose).step_idx);
    assert!(graph.node(transpose).step_idx < graph.node(reshape).step_idx);
}

#[test]
fn builder_rejects_duplicate_names() {
    let mut builder = GraphBuilder::new();
    builder.input("node", [1]);
    builder.output("node");
    assert!(matches!(builder.build(), Err(Error::InvalidGraph(_))));
}

#[test]
fn inference_rejects_bad_reshape() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [2, 3]);
    let reshape = builder.reshape("reshape", [2, 3], [7]);
    let output = builder.output("output");
    builder.edge(input, reshape);
    builder.edge(reshape, output);
    assert!(matches!(builder.build(), Err(Error::ShapeInference(_))));
}

#[test]
fn execute_transpose_and_reshape() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [2, 3]);
    let transpose = builder.transpose("transpose", [1, 0]);
    let reshape = builder.reshape("reshape", [3, 2], [6]);
    let output = builder.output("output");
    builder.edge(input, transpose);
    builder.edge(transpose, reshape);
    builder.edge(reshape, output);
    let graph = builder.build().unwrap();

    let outputs = graph.execute(&[seq_array(&[2, 3])]).unwrap();
    let expected = ndarray::ArrayD::from_shape_vec(
        IxDyn(&[6]),
        vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0],
    )
    .unwrap();
    assert_eq!(outputs, vec![expected]);
}

#[test]
fn execute_broadcast_add() {
    let mut builder = GraphBuilder::new();
    let a = builder.input("a", [2, 3]);
    let b = builder.input("b", [3]);
    let add = builder.binary("add", BinaryOp::Add);
    let output = builder.output("output");
    builder.edge_to_port(a, add, 0);
    builder.edge_to_port(b, add, 1);
    builder.edge(add, output);
    let graph = builder.build().unwrap();
    assert_eq!(graph.node(add).out_dims, vec![Shape::from([2, 3])]);

    let outputs = graph
        .execute(&[seq_array(&[2, 3]), seq_array(&[3])])
        .unwrap();
    let expected = ndarray::ArrayD::from_shape_vec(
        IxDyn(&[2, 3]),
        vec![0.0, 2.0, 4.0, 3.0, 5.0, 7.0],
    )
    .unwrap();
    assert_eq!(outputs, vec![expected]);
}

#[test]
fn execute_concat_and_slice() {
    let mut builder = GraphBuilder::new();
    let a = builder.input("a", [2, 2]);
    let b = builder.input("b", [2, 2]);
    let concat = builder.concat("concat", 0);
    let slice = builder.strided_slice(
        "slice",
        vec![
            SliceSpec {
                begin: 1,
                end: 4,
                stride: 2,
            },
            SliceSpec::full(2),
        ],
        None,
    );
    let output = builder.output("output");
    builder.edge_to_port(a, concat, 0);
    builder.edge_to_port(b, concat, 1);
    builder.edge(concat, slice);
    builder.edge(slice, output);
    let graph = builder.build().unwrap();
    assert_eq!(graph.node(concat).out_dims, vec![Shape::from([4, 2])]);
    assert_eq!(graph.node(slice).out_dims, vec![Shape::from([2, 2])]);

    // Rows of the concatenation are [0,1],[2,3],[4,5],[6,7]; the slice takes
    // rows 1 and 3.
    let outputs = graph
        .execute(&[seq_array(&[2, 2]), {
            let mut second = seq_array(&[2, 2]);
            second.mapv_inplace(|x| x + 4.0);
            second
        }])
        .unwrap();
    let expected =
        ndarray::ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![2.0, 3.0, 6.0, 7.0]).unwrap();
    assert_eq!(outputs, vec![expected]);
}

#[test]
fn execute_pad_places_data_inside_zeros() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [1, 2]);
    let pad = builder.pad("pad", vec![(0, 0), (1, 1)]);
    let output = builder.output("output");
    builder.edge(input, pad);
    builder.edge(pad, output);
    let graph = builder.build().unwrap();
    assert_eq!(graph.node(pad).out_dims, vec![Shape::from([1, 4])]);

    let outputs = graph.execute(&[seq_array(&[1, 2])]).unwrap();
    let expected =
        ndarray::ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![0.0, 0.0, 1.0, 0.0]).unwrap();
    assert_eq!(outputs, vec![expected]);
}

#[test]
fn execute_softmax_normalizes_lanes() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [2, 4]);
    let softmax = builder.softmax("softmax", 1);
    let output = builder.output("output");
    builder.edge(input, softmax);
    builder.edge(softmax, output);
    let graph = builder.build().unwrap();

    let outputs = graph.execute(&[varied_array(&[2, 4], 7)]).unwrap();
    for row in 0..2 {
        let sum: f32 = (0..4).map(|col| outputs[0][[row, col]]).sum();
        assert!((sum - 1.0).abs() < 1e-5, "row {} sums to {}", row, sum);
    }
}

#[test]
fn execute_linear_matches_hand_computation() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [3]);
    let weights = ndarray::ArrayD::from_shape_vec(
        IxDyn(&[2, 3]),
        vec![1.0, 0.0, 2.0, 0.0, 1.0, -1.0],
    )
    .unwrap();
    let linear = builder.linear("linear", weights, Some(vec![0.5, -0.5]), 1);
    let output = builder.output("output");
    builder.edge(input, linear);
    builder.edge(linear, output);
    let graph = builder.build().unwrap();

    let outputs = graph.execute(&[seq_array(&[3])]).unwrap();
    // x = [0,1,2]: y0 = 0*1 + 1*0 + 2*2 + 0.5, y1 = 0*0 + 1*1 + 2*-1 - 0.5.
    let expected =
        ndarray::ArrayD::from_shape_vec(IxDyn(&[2]), vec![4.5, -1.5]).unwrap();
    assert_eq!(outputs, vec![expected]);
}
