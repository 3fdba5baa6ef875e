// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The downward explorer: follows data flow from a transpose, collecting the
//! actions that would absorb or re-anchor its permutation.

use crate::eliminate::actions::{Action, PortDir};
use crate::eliminate::reshape_math::reverse_reshape;
use crate::eliminate::search_up::search_up;
use crate::eliminate::visited::{VisitTag, VisitedNodes};
use crate::eliminate::{check_continue, current_transpose, require_perm, CantContinue};
use crate::eliminate::TransposeHistory;
use crate::graph::{Edge, NNGraph, NodeRef, Op};
use crate::shape::{broadcast_axes, max_shape, Perm, Shape};
use indexmap::IndexSet;
use log::{debug, info};

/// Searches down the graph for something that eliminates the transpose.
///
/// `history` carries the permutation rewrites met so far; its last entry's
/// permutation is the one currently being pushed. Returns the actions of
/// this branch and the nodes it claims, or fails the frontier.
pub(crate) fn search_down(
    graph: &NNGraph,
    node: NodeRef,
    exclude: &IndexSet<NodeRef>,
    visited: &VisitedNodes,
    in_edge: Edge,
    history: &[TransposeHistory],
) -> Result<(Vec<Action>, VisitedNodes), CantContinue> {
    let mut cur_visited = VisitedNodes::new();
    cur_visited.visit_down(node, in_edge.to_port);

    let data = graph.node(node);
    let mut transpose: Option<Perm> = current_transpose(history).cloned();
    let in_shape: Shape = data.in_dims[in_edge.to_port].clone();
    debug!(
        "down at {} trans {:?} shape {}",
        data.name, transpose, in_shape
    );

    // A single-axis permutation cannot move anything.
    if let Some(t) = &transpose {
        if t.rank() == 1 {
            return Ok((vec![Action::EndDown { node }], VisitedNodes::new()));
        }
    }

    if data.op.is_sensitive_to_order()
        && transpose
            .as_ref()
            .map_or(false, |t| t.reverse().does_nothing(&in_shape))
    {
        let t = require_perm(graph, node, &transpose)?;
        let new_shape = t.reverse().apply(&in_shape);
        // The transpose moves no data but may still move the unit axes of
        // the shape.
        if new_shape == in_shape {
            return Ok((vec![Action::EndDown { node }], cur_visited));
        }
        info!(
            "accepted {} - transpose does nothing but requires reshape {}->{}",
            data.name, new_shape, in_shape
        );
        return Ok((
            vec![
                Action::InsertReshape {
                    node,
                    dir: PortDir::In,
                    idx: in_edge.to_port,
                    dest: None,
                    in_shape: new_shape,
                    out_shape: in_shape,
                },
                Action::EndDown { node },
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
                    dir: PortDir::In,
                    idx: in_edge.to_port,
                    dest: None,
                    perm: t.clone(),
                },
                Action::EndDown { node },
            ],
            cur_visited,
        ));
    }

    let mut cur_actions: Vec<Action> = Vec::new();
    let mut history: Vec<TransposeHistory> = history.to_vec();

    // Arriving on a broadcasted input: expand the permutation over the
    // implicit leading unit axes. The new axes carry no data, so no reshape
    // is necessary on this edge.
    if data.op.is_broadcastable() && in_shape.rank() != data.out_dims[0].rank() {
        let t = require_perm(graph, node, &transpose)?;
        let full_shape = max_shape(&data.out_dims);
        let b_axes = broadcast_axes(&in_shape, &full_shape);
        let new_transpose = t.expand_axes(b_axes.len());
        let new_shape = in_shape.prepend_units(b_axes.len());
        history.push(TransposeHistory::new(
            node,
            in_shape.clone(),
            Some(new_transpose.clone()),
            new_shape,
        ));
        transpose = Some(new_transpose);
    }

    // Operators whose inputs must all carry the same permutation: recurse
    // upwards into every sibling so they receive a compatible one.
    if data.op.explores_up() {
        let t = require_perm(graph, node, &transpose)?.clone();
        let full_shape = max_shape(&data.out_dims);
        for edge in graph.in_edges(node) {
            if edge == in_edge {
                continue;
            }
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
            let t = t.clone();
            let edge_in_shape = data.in_dims[edge.to_port].clone();
            // A broadcasted sibling sees fewer axes; strip the broadcast off
            // the permutation and reshape the sibling when the shapes drift.
            let new_transpose = if edge_in_shape.rank() != full_shape.rank() {
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
                stripped
            } else {
                t
            };
            let sibling_history = vec![TransposeHistory::new(
                node,
                edge_in_shape.clone(),
                Some(new_transpose),
                edge_in_shape,
            )];
            let merged = visited.union(&cur_visited);
            let (new_actions, visited_up) =
                search_up(graph, edge.from, exclude, &merged, edge, &sibling_history)?;
            cur_visited.merge(&visited_up);
            cur_actions.extend(new_actions);
        }
    }

    // Conditions that can absorb the transpose.

    if let Some(linear) = data.op.linear() {
        if linear.batch_size > 1 {
            let t = require_perm(graph, node, &transpose)?;
            info!(
                "rejected {} - multibatch linear layer - inserting transpose {}",
                data.name, t
            );
            return Ok((
                vec![
                    Action::InsertTranspose {
                        node,
                        dir: PortDir::In,
                        idx: in_edge.to_port,
                        dest: None,
                        perm: t.clone(),
                    },
                    Action::EndDown { node },
                ],
                cur_visited,
            ));
        }
        info!(
            "accepted {} - linear layer reorder input - {:?}",
            data.name, transpose
        );
        let reorder = Action::reorder_linear_from_history(graph, node, PortDir::In, &history)?;
        cur_actions.push(reorder);
        cur_actions.push(Action::EndDown { node });
        return Ok((cur_actions, cur_visited));
    }

    if let Op::Transpose { perm: node_perm } = &data.op {
        let t = require_perm(graph, node, &transpose)?;
        let out_shape = &data.out_dims[0];
        let combined = t.compose(node_perm);
        if combined.is_identity() {
            info!(
                "accepted {} - transpose {} reversed by {}",
                data.name, node_perm, t
            );
            return Ok((
                vec![
                    Action::DeleteTranspose {
                        node,
                        reshape: None,
                    },
                    Action::EndDown { node },
                ],
                cur_visited,
            ));
        }
        let rewritten = combined.reverse().apply(out_shape);
        if combined.does_nothing(&rewritten) {
            let reshape = if rewritten != *out_shape {
                info!("requires reshape {} -> {}", rewritten, out_shape);
                Some((rewritten, out_shape.clone()))
            } else {
                None
            };
            info!(
                "accepted {} - transpose {} cancelled by {} up to unit axes",
                data.name, node_perm, t
            );
            return Ok((
                vec![
                    Action::DeleteTranspose { node, reshape },
                    Action::EndDown { node },
                ],
                cur_visited,
            ));
        }
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

    if let Op::Output { fixed_order } = data.op {
        let t = require_perm(graph, node, &transpose)?;
        if fixed_order {
            info!(
                "rejected {} - fixed order output - inserting transpose {}",
                data.name, t
            );
            return Ok((
                vec![
                    Action::InsertTranspose {
                        node,
                        dir: PortDir::In,
                        idx: in_edge.to_port,
                        dest: None,
                        perm: t.clone(),
                    },
                    Action::EndDown { node },
                ],
                cur_visited,
            ));
        }
        info!(
            "accepted {} - output without fixed order - transpose output {}",
            data.name, t
        );
        // No change here: the output dimensions are recomputed by shape
        // inference.
        return Ok((vec![Action::EndDown { node }], cur_visited));
    }

    let reshaping_slice = match &data.op {
        Op::StridedSlice {
            slice_shape,
            out_shape,
            ..
        } => slice_shape != out_shape,
        _ => false,
    };

    if reshaping_slice {
        let (slice_shape, out_shape) = match &data.op {
            Op::StridedSlice {
                slice_shape,
                out_shape,
                ..
            } => (slice_shape.clone(), out_shape.clone()),
            _ => unreachable!(),
        };
        let t = require_perm(graph, node, &transpose)?.clone();
        let (new_transpose, _, to_shape) = reverse_reshape(&t, &slice_shape, &out_shape, false);
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
                            dir: PortDir::In,
                            idx: in_edge.to_port,
                            dest: None,
                            perm: t,
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
            perm: t.reverse(),
            out_shape: to_shape,
        });
        if new_transpose.is_identity() {
            cur_actions.push(Action::EndDown { node });
            return Ok((cur_actions, cur_visited));
        }
        history.push(TransposeHistory::new(
            node,
            slice_shape,
            Some(new_transpose),
            out_shape,
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
        let (new_transpose, from_shape, to_shape) =
            reverse_reshape(&t, old_shape, shape, false);
        info!(
            "pass reshape {} down trans: old {} new {:?} shape: old {} new {}",
            data.name, t, new_transpose, old_shape, shape
        );

        if new_transpose.is_none() && shape.rank() > 1 {
            info!(
                "rejected {} - cannot pass reshape - inserting transpose {}",
                data.name, t
            );
            return Ok((
                vec![
                    Action::InsertTranspose {
                        node,
                        dir: PortDir::In,
                        idx: in_edge.to_port,
                        dest: None,
                        perm: t,
                    },
                    Action::EndDown { node },
                ],
                cur_visited,
            ));
        }

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
            cur_actions.push(Action::EndDown { node });
            return Ok((cur_actions, cur_visited));
        }

        history.push(TransposeHistory::new(
            node,
            old_shape.clone(),
            new_transpose.clone(),
            shape.clone(),
        ));

        if new_transpose.is_none() {
            // A rank-1 result is ambiguous: keep going in the hope of
            // reaching a layer that can reorder itself from the history.
            match continue_down(
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
                                dir: PortDir::In,
                                idx: in_edge.to_port,
                                dest: None,
                                perm: t,
                            },
                            Action::EndDown { node },
                        ],
                        cur_visited,
                    ));
                }
            }
        }
    }

    continue_down(
        graph,
        node,
        exclude,
        visited,
        cur_visited,
        cur_actions,
        &history,
    )
}

/// Recurses into every out-edge that has not been handled yet.
pub(crate) fn continue_down(
    graph: &NNGraph,
    node: NodeRef,
    exclude: &IndexSet<NodeRef>,
    visited: &VisitedNodes,
    mut cur_visited: VisitedNodes,
    mut cur_actions: Vec<Action>,
    history: &[TransposeHistory],
) -> Result<(Vec<Action>, VisitedNodes), CantContinue> {
    for edge in graph.out_edges(node) {
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
        let merged = visited.union(&cur_visited);
        let (new_actions, visited_down) =
            search_down(graph, edge.to, exclude, &merged, edge, history)?;
        cur_visited.merge(&visited_down);
        cur_actions.extend(new_actions);
    }
    Ok((cur_actions, cur_visited))
}
