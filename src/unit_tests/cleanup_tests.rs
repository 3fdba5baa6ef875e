// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::fixtures::{seq_array, snapshot};
use crate::eliminate::driver::{fuse_reshapes, fuse_transposes, remove_no_op_reshapes};
use crate::graph::{ActivationKind, GraphBuilder, Op, UnaryOp};
use crate::shape::Shape;
use crate::{eliminate_transposes, EliminateOptions};
use pretty_assertions::assert_eq;

#[test]
fn removes_no_op_reshapes() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [2, 3]);
    let reshape = builder.reshape("reshape", [2, 3], [2, 3]);
    let output = builder.output("output");
    builder.edge(input, reshape);
    builder.edge(reshape, output);
    let mut graph = builder.build().unwrap();

    remove_no_op_reshapes(&mut graph).unwrap();
    graph.add_dimensions().unwrap();

    assert_eq!(graph.node_count(), 2);
    assert!(graph.node_by_name("reshape").is_none());
}

#[test]
fn fuses_reshapes_through_elementwise_chain() {
    let mut builder = GraphBuilder::new();
    let input = builder.fixed_input("input", [2, 3]);
    let first = builder.reshape("first", [2, 3], [6]);
    let relu = builder.activation("relu", ActivationKind::Relu);
    let second = builder.reshape("second", [6], [3, 2]);
    let output = builder.fixed_output("output");
    builder.edge(input, first);
    builder.edge(first, relu);
    builder.edge(relu, second);
    builder.edge(second, output);
    let mut graph = builder.build().unwrap();

    let fed = seq_array(&[2, 3]);
    let before = graph.execute(&[fed.clone()]).unwrap();

    // The whole-pass entry point reaches the same cleanup.
    eliminate_transposes(&mut graph, EliminateOptions::default()).unwrap();

    assert!(graph.node_by_name("second").is_none());
    let first_node = graph.node_by_name("first").unwrap();
    match &graph.node(first_node).op {
        Op::Reshape { shape, .. } => assert_eq!(shape, &Shape::from([3, 2])),
        _ => unreachable!(),
    }
    let after = graph.execute(&[fed]).unwrap();
    assert_eq!(before, after);
}

#[test]
fn fuses_transposes_through_elementwise_chain() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [2, 3, 4]);
    let first = builder.transpose("first", [1, 2, 0]);
    let negate = builder.unary("negate", UnaryOp::Neg);
    let second = builder.transpose("second", [1, 2, 0]);
    let output = builder.output("output");
    builder.edge(input, first);
    builder.edge(first, negate);
    builder.edge(negate, second);
    builder.edge(second, output);
    let mut graph = builder.build().unwrap();

    let fed = seq_array(&[2, 3, 4]);
    let before = graph.execute(&[fed.clone()]).unwrap();

    fuse_transposes(&mut graph).unwrap();
    graph.add_dimensions().unwrap();

    assert!(graph.node_by_name("second").is_none());
    let first_node = graph.node_by_name("first").unwrap();
    match &graph.node(first_node).op {
        Op::Transpose { perm } => assert_eq!(perm.axes(), &[2, 0, 1]),
        _ => unreachable!(),
    }
    let after = graph.execute(&[fed]).unwrap();
    assert_eq!(before, after);
}

#[test]
fn cleanup_is_idempotent() {
    let mut builder = GraphBuilder::new();
    let input = builder.fixed_input("input", [2, 3]);
    let first = builder.reshape("first", [2, 3], [6]);
    let relu = builder.activation("relu", ActivationKind::Relu);
    let second = builder.reshape("second", [6], [3, 2]);
    let noop = builder.reshape("noop", [3, 2], [3, 2]);
    let output = builder.fixed_output("output");
    builder.edge(input, first);
    builder.edge(first, relu);
    builder.edge(relu, second);
    builder.edge(second, noop);
    builder.edge(noop, output);
    let mut graph = builder.build().unwrap();

    remove_no_op_reshapes(&mut graph).unwrap();
    fuse_reshapes(&mut graph).unwrap();
    fuse_transposes(&mut graph).unwrap();
    graph.add_dimensions().unwrap();
    let once = snapshot(&graph);

    remove_no_op_reshapes(&mut graph).unwrap();
    fuse_reshapes(&mut graph).unwrap();
    fuse_transposes(&mut graph).unwrap();
    graph.add_dimensions().unwrap();

    assert_eq!(snapshot(&graph), once);
}
