// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::fixtures::{seq_array, snapshot, varied_array};
use crate::errors::Error;
use crate::graph::{BinaryOp, GraphBuilder, NNGraph, NodeId, Op, QuantRecord};
use crate::shape::Shape;
use crate::{eliminate_transposes, EliminateOptions};
use ndarray::ArrayD;
use pretty_assertions::assert_eq;

fn run(graph: &mut NNGraph) {
    eliminate_transposes(graph, EliminateOptions::default()).expect("pass must converge");
}

fn permuted(value: &ArrayD<f32>, axes: &[usize]) -> ArrayD<f32> {
    value.view().permuted_axes(axes).to_owned()
}

/// A cancelling transpose pair disappears without leaving a reshape behind.
#[test]
fn cancelling_pair_is_removed() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [1, 3, 4, 5]);
    let first = builder.transpose("first", [0, 2, 3, 1]);
    let second = builder.transpose("second", [0, 3, 1, 2]);
    let output = builder.output("output");
    builder.edge(input, first);
    builder.edge(first, second);
    builder.edge(second, output);
    let mut graph = builder.build().unwrap();

    let fed = seq_array(&[1, 3, 4, 5]);
    let before = graph.execute(&[fed.clone()]).unwrap();

    run(&mut graph);

    assert_eq!(graph.transpose_count(), 0);
    assert_eq!(graph.node_count(), 2, "only input and output remain");
    let after = graph.execute(&[fed]).unwrap();
    assert_eq!(before, after);
}

/// A transpose in front of a constant-fed binary op is absorbed by
/// re-permuting the stored tensor.
#[test]
fn absorbs_into_constant() {
    let mut builder = GraphBuilder::new();
    let constant = builder.constant("constant", varied_array(&[8, 3, 1, 1], 3));
    let transpose = builder.transpose("transpose", [1, 2, 3, 0]);
    let add = builder.binary("add", BinaryOp::Add);
    let input = builder.input("input", [8]);
    let output = builder.output("output");
    builder.edge(constant, transpose);
    builder.edge_to_port(transpose, add, 0);
    builder.edge_to_port(input, add, 1);
    builder.edge(add, output);
    let mut graph = builder.build().unwrap();

    let fed = varied_array(&[8], 11);
    let before = graph.execute(&[fed.clone()]).unwrap();

    run(&mut graph);

    assert_eq!(graph.transpose_count(), 0);
    assert_eq!(graph.node_count(), 4, "no compensating nodes were added");
    let constant_node = graph.node_by_name("constant").unwrap();
    match &graph.node(constant_node).op {
        Op::Constant { value } => assert_eq!(value.shape(), &[3, 1, 1, 8]),
        op => panic!("expected a constant, found {}", op.kind_name()),
    }
    let after = graph.execute(&[fed]).unwrap();
    assert_eq!(before, after);
}

/// A transpose pushes through a reshape and is absorbed by a linear layer
/// re-permuting its weights on the input axis.
#[test]
fn pushes_through_reshape_into_linear() {
    let mut builder = GraphBuilder::new();
    let input = builder.fixed_input("input", [1, 3, 4, 5]);
    let transpose = builder.transpose("transpose", [0, 2, 3, 1]);
    let reshape = builder.reshape("reshape", [1, 4, 5, 3], [20, 3]);
    let linear = builder.linear("linear", varied_array(&[7, 60], 5), None, 1);
    let output = builder.output("output");
    builder.edge(input, transpose);
    builder.edge(transpose, reshape);
    builder.edge(reshape, linear);
    builder.edge(linear, output);
    let mut graph = builder.build().unwrap();

    let fed = varied_array(&[1, 3, 4, 5], 17);
    let before = graph.execute(&[fed.clone()]).unwrap();

    run(&mut graph);

    assert_eq!(graph.transpose_count(), 0);
    let reshape_node = graph.node_by_name("reshape").unwrap();
    match &graph.node(reshape_node).op {
        Op::Reshape { old_shape, shape } => {
            assert_eq!(old_shape, &Shape::from([1, 3, 4, 5]));
            assert_eq!(shape, &Shape::from([3, 20]));
        }
        op => panic!("expected a reshape, found {}", op.kind_name()),
    }
    let after = graph.execute(&[fed]).unwrap();
    for (expected, actual) in before[0].iter().zip(after[0].iter()) {
        // The reorder changes the summation order, so allow float drift.
        assert!(
            (expected - actual).abs() <= 1e-4 * expected.abs().max(1.0),
            "linear output drifted: {} vs {}",
            expected,
            actual
        );
    }
}

/// Softmax is sensitive to axis order: the transpose is not eliminated.
#[test]
fn stops_at_order_sensitive_softmax() {
    let mut builder = GraphBuilder::new();
    let input = builder.fixed_input("input", [2, 3, 4]);
    let transpose = builder.transpose("transpose", [0, 2, 1]);
    let softmax = builder.softmax("softmax", 2);
    let output = builder.output("output");
    builder.edge(input, transpose);
    builder.edge(transpose, softmax);
    builder.edge(softmax, output);
    let mut graph = builder.build().unwrap();

    let before_snapshot = snapshot(&graph);
    run(&mut graph);

    assert_eq!(graph.transpose_count(), 1, "the transpose must remain");
    assert_eq!(snapshot(&graph), before_snapshot, "nothing changed");
}

/// Pushing through a broadcasting add reshapes the broadcast operand so it
/// still lines up after the move.
#[test]
fn broadcast_sibling_gets_reshape() {
    let mut builder = GraphBuilder::new();
    let a = builder.fixed_input("a", [1, 4, 2, 2]);
    let transpose = builder.transpose("transpose", [0, 2, 3, 1]);
    let add = builder.binary("add", BinaryOp::Add);
    let b = builder.input("b", [4]);
    let output = builder.output("output");
    builder.edge(a, transpose);
    builder.edge_to_port(transpose, add, 0);
    builder.edge_to_port(b, add, 1);
    builder.edge(add, output);
    let mut graph = builder.build().unwrap();

    let fed_a = varied_array(&[1, 4, 2, 2], 23);
    let fed_b = varied_array(&[4], 29);
    let before = graph.execute(&[fed_a.clone(), fed_b.clone()]).unwrap();

    run(&mut graph);

    assert_eq!(graph.transpose_count(), 0);
    let reshapes = graph.nodes_filtered(|op| matches!(op, Op::Reshape { .. }));
    assert_eq!(reshapes.len(), 1, "one broadcast-fix reshape inserted");
    match &graph.node(reshapes[0]).op {
        Op::Reshape { old_shape, shape } => {
            assert_eq!(old_shape, &Shape::from([4]));
            assert_eq!(shape, &Shape::from([4, 1, 1]));
        }
        _ => unreachable!(),
    }
    // The output absorbed the permutation; undo it to compare.
    let after = graph.execute(&[fed_a, fed_b]).unwrap();
    assert_eq!(before[0], permuted(&after[0], &[0, 2, 3, 1]));
}

/// A transpose that cannot cancel fuses into the next transpose node.
#[test]
fn fuses_into_downstream_transpose() {
    let mut builder = GraphBuilder::new();
    let input = builder.fixed_input("input", [2, 3, 4]);
    let first = builder.transpose("first", [1, 2, 0]);
    let second = builder.transpose("second", [1, 2, 0]);
    let output = builder.fixed_output("output");
    builder.edge(input, first);
    builder.edge(first, second);
    builder.edge(second, output);
    let mut graph = builder.build().unwrap();

    let fed = seq_array(&[2, 3, 4]);
    let before = graph.execute(&[fed.clone()]).unwrap();

    run(&mut graph);

    assert_eq!(graph.transpose_count(), 1);
    let second_node = graph.node_by_name("second").unwrap();
    match &graph.node(second_node).op {
        Op::Transpose { perm } => assert_eq!(perm.axes(), &[2, 0, 1]),
        op => panic!("expected a transpose, found {}", op.kind_name()),
    }
    let after = graph.execute(&[fed]).unwrap();
    assert_eq!(before, after);
}

/// The special `(1,0)` permutation on a batched linear layer becomes a
/// batch-dimension switch instead of a runtime shuffle.
#[test]
fn switches_batch_on_batched_linear() {
    let mut builder = GraphBuilder::new();
    let input = builder.fixed_input("input", [4, 10]);
    let linear = builder.linear("linear", varied_array(&[6, 10], 31), Some(vec![0.0; 6]), 4);
    let transpose = builder.transpose("transpose", [1, 0]);
    let output = builder.fixed_output("output");
    builder.edge(input, linear);
    builder.edge(linear, transpose);
    builder.edge(transpose, output);
    let mut graph = builder.build().unwrap();

    let fed = varied_array(&[4, 10], 37);
    let before = graph.execute(&[fed.clone()]).unwrap();

    run(&mut graph);

    assert_eq!(graph.transpose_count(), 0);
    let linear_node = graph.node_by_name("linear").unwrap();
    assert!(graph.node(linear_node).op.linear().unwrap().batch_minor);
    let after = graph.execute(&[fed]).unwrap();
    assert_eq!(before, after);
}

/// Pushing up through a flattening reshape reaches the linear layer, which
/// reorders its output features, bias, and quantization channel scales.
#[test]
fn reorders_linear_output_through_flatten() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [10]);
    let linear = builder.linear(
        "linear",
        varied_array(&[6, 10], 41),
        Some(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        1,
    );
    let reshape = builder.reshape("reshape", [6], [2, 3]);
    let transpose = builder.transpose("transpose", [1, 0]);
    let output = builder.fixed_output("output");
    builder.edge(input, linear);
    builder.edge(linear, reshape);
    builder.edge(reshape, transpose);
    builder.edge(transpose, output);
    let mut graph = builder.build().unwrap();
    graph.quantization.insert(
        NodeId::new("linear"),
        QuantRecord {
            in_scale: 1.0,
            out_scale: 1.0,
            channel_scales: Some(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]),
        },
    );

    let fed = varied_array(&[10], 43);
    let before = graph.execute(&[fed.clone()]).unwrap();

    run(&mut graph);

    assert_eq!(graph.transpose_count(), 0);
    let linear_node = graph.node_by_name("linear").unwrap();
    let bias = graph
        .node(linear_node)
        .op
        .linear()
        .unwrap()
        .bias
        .clone()
        .unwrap();
    assert_eq!(bias, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    let record = &graph.quantization[&NodeId::new("linear")];
    assert_eq!(
        record.channel_scales.as_deref(),
        Some(&[10.0, 40.0, 20.0, 50.0, 30.0, 60.0][..])
    );
    let after = graph.execute(&[fed]).unwrap();
    assert_eq!(before, after);
}

/// A permutation passes a concat by rewriting the concat axis; the constant
/// sibling is re-permuted statically.
#[test]
fn rewrites_concat_axis_in_passing() {
    let mut builder = GraphBuilder::new();
    let a = builder.fixed_input("a", [2, 3, 4]);
    let transpose = builder.transpose("transpose", [2, 0, 1]);
    let concat = builder.concat("concat", 0);
    let constant = builder.constant("constant", varied_array(&[4, 2, 3], 47));
    let output = builder.output("output");
    builder.edge(a, transpose);
    builder.edge_to_port(transpose, concat, 0);
    builder.edge_to_port(constant, concat, 1);
    builder.edge(concat, output);
    let mut graph = builder.build().unwrap();

    let fed = varied_array(&[2, 3, 4], 53);
    let before = graph.execute(&[fed.clone()]).unwrap();

    run(&mut graph);

    assert_eq!(graph.transpose_count(), 0);
    let concat_node = graph.node_by_name("concat").unwrap();
    match &graph.node(concat_node).op {
        Op::Concat { axis } => assert_eq!(*axis, 2),
        _ => unreachable!(),
    }
    let after = graph.execute(&[fed]).unwrap();
    assert_eq!(before[0], permuted(&after[0], &[2, 0, 1]));
}

/// A pad is transient: the permutation rewrites its per-axis padding and
/// moves on.
#[test]
fn rewrites_pad_in_passing() {
    let mut builder = GraphBuilder::new();
    let input = builder.fixed_input("input", [1, 2, 3, 4]);
    let transpose = builder.transpose("transpose", [0, 2, 3, 1]);
    let pad = builder.pad("pad", vec![(0, 0), (1, 1), (0, 0), (2, 2)]);
    let output = builder.output("output");
    builder.edge(input, transpose);
    builder.edge(transpose, pad);
    builder.edge(pad, output);
    let mut graph = builder.build().unwrap();

    let fed = varied_array(&[1, 2, 3, 4], 59);
    let before = graph.execute(&[fed.clone()]).unwrap();

    run(&mut graph);

    assert_eq!(graph.transpose_count(), 0);
    let pad_node = graph.node_by_name("pad").unwrap();
    match &graph.node(pad_node).op {
        Op::Pad { padding } => {
            assert_eq!(padding, &vec![(0, 0), (2, 2), (1, 1), (0, 0)])
        }
        _ => unreachable!(),
    }
    let after = graph.execute(&[fed]).unwrap();
    assert_eq!(before[0], permuted(&after[0], &[0, 2, 3, 1]));
}

/// Running the pass twice on identical graphs produces identical results.
#[test]
fn pass_is_deterministic() {
    let build = || {
        let mut builder = GraphBuilder::new();
        let a = builder.fixed_input("a", [1, 4, 2, 2]);
        let transpose = builder.transpose("transpose", [0, 2, 3, 1]);
        let add = builder.binary("add", BinaryOp::Add);
        let b = builder.input("b", [4]);
        let output = builder.output("output");
        builder.edge(a, transpose);
        builder.edge_to_port(transpose, add, 0);
        builder.edge_to_port(b, add, 1);
        builder.edge(add, output);
        builder.build().unwrap()
    };
    let mut first = build();
    let mut second = build();
    run(&mut first);
    run(&mut second);
    assert_eq!(snapshot(&first), snapshot(&second));
}

/// Once the pass reports no further results, running it again changes
/// nothing.
#[test]
fn pass_reaches_a_fixpoint() {
    let mut builder = GraphBuilder::new();
    let input = builder.fixed_input("input", [1, 3, 4, 5]);
    let transpose = builder.transpose("transpose", [0, 2, 3, 1]);
    let reshape = builder.reshape("reshape", [1, 4, 5, 3], [20, 3]);
    let linear = builder.linear("linear", varied_array(&[7, 60], 61), None, 1);
    let output = builder.output("output");
    builder.edge(input, transpose);
    builder.edge(transpose, reshape);
    builder.edge(reshape, linear);
    builder.edge(linear, output);
    let mut graph = builder.build().unwrap();

    run(&mut graph);
    let settled = snapshot(&graph);
    run(&mut graph);
    assert_eq!(snapshot(&graph), settled);
}

/// The transpose count never increases.
#[test]
fn transpose_count_is_monotone() {
    let mut builder = GraphBuilder::new();
    let input = builder.fixed_input("input", [2, 3, 4]);
    let transpose = builder.transpose("transpose", [0, 2, 1]);
    let softmax = builder.softmax("softmax", 2);
    let output = builder.output("output");
    builder.edge(input, transpose);
    builder.edge(transpose, softmax);
    builder.edge(softmax, output);
    let mut graph = builder.build().unwrap();

    let before = graph.transpose_count();
    run(&mut graph);
    assert!(graph.transpose_count() <= before);
}

/// The stuck-loop failure is fatal and self-describing.
#[test]
fn stuck_loop_error_mentions_the_loop() {
    let error = Error::StuckInLoop { passes: 50 };
    assert!(error.to_string().contains("stuck in a loop"));
}

/// The debug hook runs once per pass, including the final empty one.
#[test]
fn debug_hook_sees_every_pass() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [1, 3, 4, 5]);
    let first = builder.transpose("first", [0, 2, 3, 1]);
    let second = builder.transpose("second", [0, 3, 1, 2]);
    let output = builder.output("output");
    builder.edge(input, first);
    builder.edge(first, second);
    builder.edge(second, output);
    let mut graph = builder.build().unwrap();

    let mut calls = 0;
    let mut hook = |_graph: &NNGraph| calls += 1;
    eliminate_transposes(
        &mut graph,
        EliminateOptions {
            debug_hook: Some(&mut hook),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(calls, 2, "one committing pass and one empty pass");
}

/// Upward-only mode still performs upward absorptions.
#[test]
fn only_up_still_absorbs_into_constant() {
    let mut builder = GraphBuilder::new();
    let constant = builder.constant("constant", varied_array(&[8, 3, 1, 1], 67));
    let transpose = builder.transpose("transpose", [1, 2, 3, 0]);
    let add = builder.binary("add", BinaryOp::Add);
    let input = builder.input("input", [8]);
    let output = builder.output("output");
    builder.edge(constant, transpose);
    builder.edge_to_port(transpose, add, 0);
    builder.edge_to_port(input, add, 1);
    builder.edge(add, output);
    let mut graph = builder.build().unwrap();

    eliminate_transposes(
        &mut graph,
        EliminateOptions {
            only_up: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(graph.transpose_count(), 0);
}

/// A step cap stops the driver early without error.
#[test]
fn step_cap_stops_early() {
    let mut builder = GraphBuilder::new();
    let input = builder.input("input", [1, 3, 4, 5]);
    let first = builder.transpose("first", [0, 2, 3, 1]);
    let second = builder.transpose("second", [0, 3, 1, 2]);
    let output = builder.output("output");
    builder.edge(input, first);
    builder.edge(first, second);
    builder.edge(second, output);
    let mut graph = builder.build().unwrap();

    eliminate_transposes(
        &mut graph,
        EliminateOptions {
            steps: Some(0),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(graph.transpose_count(), 2, "zero steps leaves the graph alone");
}
