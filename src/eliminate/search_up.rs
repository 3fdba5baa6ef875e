// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The upward explorer: walks against data flow from a transpose, looking
//! for a producer that can absorb its permutation.
//!
//! Mostly a mirror image of the downward explorer, with three asymmetries:
//! sibling consumers of a visited node are explored *downwards* (they must
//! keep receiving the original layout), a batched linear layer can absorb
//! exactly the `(1,0)` permutation by switching its batch dimension, and
//! inputs and constants terminate the walk by being reordered in place.

use crate::eliminate::actions::{Action, PortDir};
use crate::eliminate::reshape_math::reverse_reshape;
use crate::eliminate::search_down::search_down;
use crate::eliminate::visited::{VisitTag, VisitedNodes};
use crate::eliminate::{check_continue, current_transpose, require_perm, CantContinue};
use crate::eliminate::TransposeHistory;
use crate::graph::{Edge, NNGraph, NodeRef, Op};
use crate::shape::{broadcast_axes, max_shape, Perm, Shape};
use indexmap::IndexSet;
use log::{debug, info};

/// Searches up the graph for something that eliminates the transpose.
pub(crate) fn search_up(
    graph: &NNGraph,
    node: NodeRef,
    exclude: &IndexSet<NodeRef>,
    visited: &VisitedNodes,
    out_edge: Edge,
    history: &[TransposeHistory],
) -> Result<(Vec<Action>, VisitedNodes), CantContinue> {
    let mut cur_visited = VisitedNodes::new();
    cur_visited.visit_up(node, out_edge.from_port);

    let data = graph.node(node);
    let transpose: Option<Perm> = current_transpose(history).cloned();
    debug!("up at {} trans {:?}", data.name, transpose);

    if let Some(t) = &transpose {
        if t.rank() == 1 {
            info!("accepted {} - single dimension transpose", data.name);
            return Ok((vec![Action::EndUp { node }], cur_visited));
        }
    }

    let out_shape = data.out_dims[out_edge.from_port].clone();
    if data.op.is_sensitive_to_order()
        && transpose
            .as_ref()
            .map_or(false, |t| t.reverse().does_nothing(&out_shape))
    {
        let t = require_perm(graph, node, &transpose)?;
        let new_shape = t.reverse().apply(&out_shape);
        if new_shape == out_shape {
            info!("accepted {} - transpose does nothing", data.name);
            return Ok((vec![Action::EndUp { node }], cur_visited));
        }
        info!(
            "accepted {} - transpose does nothing with reshape {} -> {}",
            data.name, out_shape, new_shape
        );
        return Ok((
            vec![
                Action::InsertReshape {
                    node,
                    dir: PortDir::Out,
                    idx: out_edge.from_port,
                    dest: Some(out_edge),
                    in_shape: out_shape,
                    out_shape: new_shape,
                },
                Action::EndUp { node },
            ],
            cur_visited,
        ));
    }

    if data.op.is_sensitive_to_order() {
        let t = require_perm(graph, node, &transpose)?;
        info!(
            "rejected {} - sensitive to order - inserting transpose {}",
            data.name, t
        );
        return Ok((
            vec![
                Action::InsertTranspose {
                    node,
                    dir: PortDir::Out,
                    idx: out_edge.from_port,
                    dest: Some(out_edge),
                    perm: t.reverse(),
                },
                Action::EndUp { node },
            ],
            cur_visited,
        ));
    }

    let mut cur_actions: Vec<Action> = Vec::new();

    // Visit every other consumer of this node downwards first: pushing the
    // permutation up means this node will produce the transposed layout, so
    // every sibling consumer must have the original layout restored.
    for edge in graph.out_edges(node) {
        if edge == out_edge {
            continue;
        }
        let t = require_perm(graph, node, &transpose)?.clone();
        if check_continue(
            graph,
            visited,
            &cur_visited,
            exclude,
            edge.to,
            VisitTag::Down(edge.to_port),
        )? {
            continue;
        }
        let sibling_shape = data.out_dims[edge.from_port].clone();
        let sibling_history = vec![TransposeHistory::new(
            node,
            sibling_shape.clone(),
            Some(t.clone()),
            t.apply(&sibling_shape),
        )];
        let merged = visited.union(&cur_visited);
        let (new_actions, visited_down) =
            search_down(graph, edge.to, exclude, &merged, edge, &sibling_history)?;
        cur_visited.merge(&visited_down);
        cur_actions.extend(new_actions);
    }

    // Conditions that can absorb the transpose.

    if let Some(linear) = data.op.linear() {
        if linear.batch_size > 1 {
            if transpose.as_ref().map_or(false, |t| t.axes() == [1, 0]) {
                info!(
                    "accepted {} - linear layer switch batch dimension",
                    data.name
                );
                cur_actions.push(Action::SwitchBatchLinear { node });
                cur_actions.push(Action::EndUp { node });
                return Ok((cur_actions, cur_visited));
            }
            let t = require_perm(graph, node, &transpose)?;
            info!("rejected {} - batched linear", data.name);
            return Ok((
                vec![
                    Action::InsertTranspose {
                        node,
                        dir: PortDir::Out,
                        idx: out_edge.from_port,
                        dest: Some(out_edge),
                        perm: t.reverse(),
                    },
                    Action::EndUp { node },
                ],
                cur_visited,
            ));
        }
        info!("accepted {} - linear layer reorder output", data.name);
        let reorder = Action::reorder_linear_from_history(graph, node, PortDir::Out, history)?;
        cur_actions.push(reorder);
        cur_actions.push(Action::EndUp { node });
        return Ok((cur_actions, cur_visited));
    }

    // A transpose node may reverse the propagated permutation or fuse with
    // it.
    if let Op::Transpose { perm: node_perm } = &data.op {
        let t = require_perm(graph, node, &transpose)?;
        if node_perm == t {
            info!(
                "accepted {} - transpose {} equals propagated {}",
                data.name, node_perm, t
            );
            let reshape = requires_reshape(node_perm, t, &data.out_dims[0]);
            if let Some((from_shape, to_shape)) = &reshape {
                info!("requires reshape {} -> {}", from_shape, to_shape);
            }
            cur_actions.push(Action::DeleteTranspose { node, reshape });
            cur_actions.push(Action::EndUp { node });
            return Ok((cur_actions, cur_visited));
        }
        let combined = node_perm.compose(&t.reverse());
        info!(
            "rejected {} - transpose - does not reverse - absorbing {} into {} -> {}",
            data.name, t, node_perm, combined
        );
        return Ok((
            vec![
                Action::SetTranspose {
                    node,
                    perm: combined,
                },
                Action::EndDown { node },
            ],
            cur_visited,
        ));
    }

    // An input can be reordered unless its layout is frozen.
    if let Op::Input { fixed_order, .. } = data.op {
        let t = require_perm(graph, node, &transpose)?;
        if fixed_order {
            info!("rejected {} - fixed order input", data.name);
            return Ok((
                vec![
                    Action::InsertTranspose {
                        node,
                        dir: PortDir::Out,
                        idx: out_edge.from_port,
                        dest: Some(out_edge),
                        perm: t.reverse(),
                    },
                    Action::EndUp { node },
                ],
                cur_visited,
            ));
        }
        info!(
            "accepted {} - input without fixed order - transpose input {}",
            data.name,
            t.reverse()
        );
        cur_actions.push(Action::ReorderInputDims {
            node,
            history: history.to_vec(),
            perm: t.reverse(),
        });
        cur_actions.push(Action::EndUp { node });
        return Ok((cur_actions, cur_visited));
    }

    // A constant can always be reordered.
    if matches!(data.op, Op::Constant { .. }) {
        let t = require_perm(graph, node, &transpose)?;
        info!(
            "accepted {} - constant input - transpose constant {}",
            data.name,
            t.reverse()
        );
        cur_actions.push(Action::ReorderConstantInput {
            node,
            history: history.to_vec(),
            perm: t.reverse(),
        });
        cur_actions.push(Action::EndUp { node });
        return Ok((cur_actions, cur_visited));
    }

    // Conditions that can pass the transpose through.

    let mut history: Vec<TransposeHistory> = history.to_vec();
    let reshaping_slice = match &data.op {
        Op::StridedSlice {
            slice_shape,
            out_shape,
            ..
        } => slice_shape != out_shape,
        _ => false,
    };

    if reshaping_slice {
        let (slice_shape, slice_out_shape) = match &data.op {
            Op::StridedSlice {
                slice_shape,
                out_shape,
                ..
            } => (slice_shape.clone(), out_shape.clone()),
            _ => unreachable!(),
        };
        let t = require_perm(graph, node, &transpose)?.clone();
        let (new_transpose, _, to_shape) =
            reverse_reshape(&t, &slice_shape, &slice_out_shape, true);
        let new_transpose = match new_transpose {
            None => {
                info!(
                    "rejected {} - cannot pass slice reshape - inserting transpose {}",
                    data.name, t
                );
                return Ok((
                    vec![
                        Action::InsertTranspose {
                            node,
                            dir: PortDir::Out,
                            idx: out_edge.from_port,
                            dest: Some(out_edge),
                            perm: t.reverse(),
                        },
                        Action::EndDown { node },
                    ],
                    cur_visited,
                ));
            }
            Some(new_transpose) => new_transpose,
        };
        cur_actions.push(Action::TransposeStridedSlice {
            node,
            perm: new_transpose.reverse(),
            out_shape: to_shape,
        });
        if new_transpose.is_identity() {
            cur_actions.push(Action::EndUp { node });
            return Ok((cur_actions, cur_visited));
        }
        history.push(TransposeHistory::new(
            node,
            slice_out_shape,
            Some(new_transpose),
            data.in_dims[0].clone(),
        ));
    } else if data.op.is_transient() {
        let t = require_perm(graph, node, &transpose)?;
        let rewrite = t.reverse();
        cur_actions.push(match &data.op {
            Op::Pad { .. } => Action::TransposePad {
                node,
                perm: rewrite,
            },
            Op::Reverse { .. } => Action::TransposeReverse {
                node,
                perm: rewrite,
            },
            Op::Concat { .. } => Action::TransposeConcat {
                node,
                perm: rewrite,
            },
            Op::StridedSlice { .. } => Action::TransposeStridedSlice {
                node,
                perm: rewrite,
                out_shape: None,
            },
            _ => unreachable!("transient set is closed"),
        });
    } else if let Op::Reshape { old_shape, shape } = &data.op {
        let t = require_perm(graph, node, &transpose)?.clone();
        // The reversed permutation is being propagated up.
        let (new_transpose, from_shape, to_shape) =
            reverse_reshape(&t, old_shape, shape, true);
        info!(
            "pass reshape {} up trans: old {} new {:?} shape: {} -> {}",
            data.name, t, new_transpose, old_shape, shape
        );
        // A rank-1 upward shape keeps going: a linear layer above may still
        // reorder its output filters.
        if new_transpose.is_none() && old_shape.rank() > 1 {
            info!(
                "rejected {} - cannot pass reshape - inserting transpose {}",
                data.name, t
            );
            return Ok((
                vec![
                    Action::InsertTranspose {
                        node,
                        dir: PortDir::Out,
                        idx: out_edge.from_port,
                        dest: Some(out_edge),
                        perm: t.reverse(),
                    },
                    Action::EndUp { node },
                ],
                cur_visited,
            ));
        }

        history.push(TransposeHistory::new(
            node,
            shape.clone(),
            new_transpose.clone(),
            old_shape.clone(),
        ));
        info!("rewrite reshape to {:?}->{:?}", from_shape, to_shape);
        if from_shape.is_none() || to_shape.is_none() || from_shape != to_shape {
            cur_actions.push(Action::SetReshape {
                node,
                in_shape: from_shape,
                out_shape: to_shape,
            });
        } else {
            cur_actions.push(Action::DeleteReshape { node });
        }

        if new_transpose.as_ref().map_or(false, Perm::is_identity) {
            cur_actions.push(Action::EndUp { node });
            return Ok((cur_actions, cur_visited));
        }

        if new_transpose.is_none() {
            match continue_up(
                graph,
                node,
                exclude,
                visited,
                cur_visited.clone(),
                cur_actions.clone(),
                &history,
            ) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    info!(
                        "rejected {} - cannot continue {} - inserting transpose {}",
                        data.name, err, t
                    );
                    return Ok((
                        vec![
                            Action::InsertTranspose {
                                node,
                                dir: PortDir::Out,
                                idx: out_edge.from_port,
                                dest: Some(out_edge),
                                perm: t.reverse(),
                            },
                            Action::EndUp { node },
                        ],
                        cur_visited,
                    ));
                }
            }
        }
    }

    continue_up(
        graph,
        node,
        exclude,
        visited,
        cur_visited,
        cur_actions,
        &history,
    )
}

/// Recurses into every in-edge that has not been handled yet, stripping the
/// broadcast off the permutation on the way into broadcasted operands.
pub(crate) fn continue_up(
    graph: &NNGraph,
    node: NodeRef,
    exclude: &IndexSet<NodeRef>,
    visited: &VisitedNodes,
    mut cur_visited: VisitedNodes,
    mut cur_actions: Vec<Action>,
    history: &[TransposeHistory],
) -> Result<(Vec<Action>, VisitedNodes), CantContinue> {
    let data = graph.node(node);
    for edge in graph.in_edges(node) {
        if check_continue(
            graph,
            visited,
            &cur_visited,
            exclude,
            edge.from,
            VisitTag::Up(edge.from_port),
        )? {
            continue;
        }
        let edge_in_shape = data.in_dims[edge.to_port].clone();
        let mut extended = history.to_vec();
        if data.op.is_broadcastable() && edge_in_shape.rank() != data.out_dims[0].rank() {
            let t = current_transpose(history)
                .ok_or_else(|| {
                    CantContinue::new(format!("can't continue at {}", data.name))
                })?
                .clone();
            let full_shape = max_shape(&data.out_dims);
            let b_axes = broadcast_axes(&edge_in_shape, &full_shape);
            let stripped = t.strip_axes(&b_axes);
            let from_shape = stripped.reverse().apply(&edge_in_shape);
            let broadcasted = edge_in_shape.prepend_units(b_axes.len());
            let to_shape = t.reverse().apply(&broadcasted).strip_leading_units();
            if from_shape != to_shape {
                info!(
                    "{} broadcasted input {} requires reshape {}->{}",
                    data.name, edge.to_port, from_shape, to_shape
                );
                cur_actions.push(Action::InsertReshape {
                    node,
                    dir: PortDir::In,
                    idx: edge.to_port,
                    dest: None,
                    in_shape: from_shape,
                    out_shape: to_shape,
                });
            }
            extended.push(TransposeHistory::new(
                node,
                broadcasted,
                Some(stripped),
                edge_in_shape,
            ));
        }
        let merged = visited.union(&cur_visited);
        let (new_actions, visited_up) =
            search_up(graph, edge.from, exclude, &merged, edge, &extended)?;
        cur_visited.merge(&visited_up);
        cur_actions.extend(new_actions);
    }
    Ok((cur_actions, cur_visited))
}

/// Whether deleting a pair of equal transposes still needs a reshape because
/// the permutation moved unit axes of the shape around.
fn requires_reshape(first: &Perm, second: &Perm, dim: &Shape) -> Option<(Shape, Shape)> {
    let layout = dim.layout_shape();
    if dim.dims() == layout.dims() {
        return None;
    }
    let chained = second.apply(&first.apply(dim));
    if chained.layout_shape() != layout {
        return None;
    }
    let from_shape = first.apply(dim);
    let to_shape = second.apply(dim);
    if from_shape != to_shape {
        Some((from_shape, to_shape))
    } else {
        None
    }
}
