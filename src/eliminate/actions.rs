// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deferred graph mutations.
//!
//! The explorers never touch the graph; they emit [`Action`]s describing the
//! rewrite they want. The driver executes a winning frontier's actions in
//! order, once, against the live graph. Actions re-resolve edges at
//! execution time because earlier actions in the same batch may already have
//! spliced nodes onto them.

use crate::eliminate::{CantContinue, TransposeHistory};
use crate::errors::Error;
use crate::graph::{Edge, NNGraph, NodeId, NodeRef, Op};
use crate::shape::{flat_permutation, Perm, Shape};
use log::info;
use ndarray::{ArrayD, IxDyn};

/// Which side of a node an insertion targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PortDir {
    /// The node's input port.
    In,
    /// The node's output port.
    Out,
}

/// A deferred, self-describing graph mutation.
#[derive(Clone, Debug)]
pub(crate) enum Action {
    /// Removes a transpose node, splicing a replacement reshape in when the
    /// deleted permutation still moved unit axes around.
    DeleteTranspose {
        node: NodeRef,
        reshape: Option<(Shape, Shape)>,
    },
    /// Splices a new transpose node onto an edge of `node`.
    InsertTranspose {
        node: NodeRef,
        dir: PortDir,
        idx: usize,
        dest: Option<Edge>,
        perm: Perm,
    },
    /// Replaces a transpose node's permutation.
    SetTranspose { node: NodeRef, perm: Perm },
    /// Removes a reshape node.
    DeleteReshape { node: NodeRef },
    /// Rewrites a reshape node's shapes in place.
    SetReshape {
        node: NodeRef,
        in_shape: Option<Shape>,
        out_shape: Option<Shape>,
    },
    /// Splices a new reshape node onto an edge of `node`.
    InsertReshape {
        node: NodeRef,
        dir: PortDir,
        idx: usize,
        dest: Option<Edge>,
        in_shape: Shape,
        out_shape: Shape,
    },
    /// Permutes a constant's stored tensor.
    ReorderConstantInput {
        node: NodeRef,
        history: Vec<TransposeHistory>,
        perm: Perm,
    },
    /// Permutes an input's declared dimensions.
    ReorderInputDims {
        node: NodeRef,
        history: Vec<TransposeHistory>,
        perm: Perm,
    },
    /// Permutes a linear layer's weights along the input or output axis.
    ReorderLinear {
        node: NodeRef,
        dir: PortDir,
        flat_perm: Vec<usize>,
        qrec: Option<NodeId>,
    },
    /// Flips a batched linear layer to produce its output batch-minor.
    SwitchBatchLinear { node: NodeRef },
    /// Permutes a pad node's per-axis padding.
    TransposePad { node: NodeRef, perm: Perm },
    /// Remaps a reverse node's axis.
    TransposeReverse { node: NodeRef, perm: Perm },
    /// Remaps a concat node's axis.
    TransposeConcat { node: NodeRef, perm: Perm },
    /// Permutes a strided slice's per-axis specs, optionally rewriting the
    /// output shape of a reshaping slice.
    TransposeStridedSlice {
        node: NodeRef,
        perm: Perm,
        out_shape: Option<Shape>,
    },
    /// Sentinel marking the terminus of an upward branch. No graph effect.
    EndUp { node: NodeRef },
    /// Sentinel marking the terminus of a downward branch. No graph effect.
    EndDown { node: NodeRef },
}

impl Action {
    /// Builds the linear-layer reorder for the given direction from the
    /// recorded history.
    ///
    /// Reshapes preserve row-major element order, so the flat weight-axis
    /// permutation is determined by the last history stage that still had a
    /// concrete permutation. When no stage lines up with the layer's element
    /// count the path crossed something that moved data, and the frontier
    /// fails rather than guessing.
    pub(crate) fn reorder_linear_from_history(
        graph: &NNGraph,
        node: NodeRef,
        dir: PortDir,
        history: &[TransposeHistory],
    ) -> Result<Action, CantContinue> {
        let data = graph.node(node);
        let linear = data
            .op
            .linear()
            .ok_or_else(|| CantContinue::new(format!("{} is not a linear layer", data.name)))?;
        let elements = match dir {
            PortDir::In => linear.batch_size * linear.in_features(),
            PortDir::Out => linear.batch_size * linear.out_features(),
        };
        let stage = history
            .iter()
            .rev()
            .find_map(|entry| {
                entry
                    .transpose
                    .as_ref()
                    .map(|perm| (perm, &entry.to_shape))
            })
            .filter(|(_, shape)| shape.num_elements() == elements)
            .ok_or_else(|| {
                CantContinue::new(format!(
                    "no usable permutation history at {}",
                    data.name
                ))
            })?;
        let flat_perm = flat_permutation(&stage.0.reverse(), stage.1);
        let qrec = NodeId::new(&data.name);
        Ok(Action::ReorderLinear {
            node,
            dir,
            flat_perm,
            qrec: graph.quantization.contains_key(&qrec).then(|| qrec),
        })
    }

    /// Applies this action to the graph.
    pub(crate) fn execute(&self, graph: &mut NNGraph) -> Result<(), Error> {
        match self {
            Action::DeleteTranspose { node, reshape } => {
                let name = graph.node(*node).name.clone();
                let in_edge = *graph
                    .indexed_in_edges(*node)
                    .first()
                    .ok_or_else(|| Error::InvalidGraph(format!("'{}' has no input", name)))?;
                let out_edges = graph.out_edges(*node);
                graph.remove_node(*node);
                let source = match reshape {
                    Some((from_shape, to_shape)) => {
                        let reshape_name = graph.fresh_name(&format!("{}_reshape", name));
                        let reshape_node = graph.add_node(
                            reshape_name,
                            Op::Reshape {
                                old_shape: from_shape.clone(),
                                shape: to_shape.clone(),
                            },
                        )?;
                        graph.add_edge(Edge {
                            from: in_edge.from,
                            from_port: in_edge.from_port,
                            to: reshape_node,
                            to_port: 0,
                        })?;
                        (reshape_node, 0)
                    }
                    None => (in_edge.from, in_edge.from_port),
                };
                for out in out_edges {
                    graph.add_edge(Edge {
                        from: source.0,
                        from_port: source.1,
                        to: out.to,
                        to_port: out.to_port,
                    })?;
                }
                Ok(())
            }
            Action::InsertTranspose {
                node,
                dir,
                idx,
                dest,
                perm,
            } => {
                let edge = resolve_edge(graph, *node, *dir, *idx, *dest)?;
                let name = graph.fresh_name(&format!("{}_trans", graph.node(*node).name));
                let new = graph.add_node(name, Op::Transpose { perm: perm.clone() })?;
                graph.insert_on_edge(edge, new)
            }
            Action::SetTranspose { node, perm } => match &mut graph.node_mut(*node).op {
                Op::Transpose { perm: existing } => {
                    *existing = perm.clone();
                    Ok(())
                }
                _ => Err(Error::InvalidGraph(
                    "set-transpose target is not a transpose".to_string(),
                )),
            },
            Action::DeleteReshape { node } => graph.remove_and_reconnect(*node),
            Action::SetReshape {
                node,
                in_shape,
                out_shape,
            } => match &mut graph.node_mut(*node).op {
                Op::Reshape { old_shape, shape } => {
                    if let Some(in_shape) = in_shape {
                        *old_shape = in_shape.clone();
                    }
                    if let Some(out_shape) = out_shape {
                        *shape = out_shape.clone();
                    }
                    Ok(())
                }
                _ => Err(Error::InvalidGraph(
                    "set-reshape target is not a reshape".to_string(),
                )),
            },
            Action::InsertReshape {
                node,
                dir,
                idx,
                dest,
                in_shape,
                out_shape,
            } => {
                let edge = resolve_edge(graph, *node, *dir, *idx, *dest)?;
                let name = graph.fresh_name(&format!("{}_reshape", graph.node(*node).name));
                let new = graph.add_node(
                    name,
                    Op::Reshape {
                        old_shape: in_shape.clone(),
                        shape: out_shape.clone(),
                    },
                )?;
                graph.insert_on_edge(edge, new)
            }
            Action::ReorderConstantInput {
                node,
                history,
                perm,
            } => {
                let data = graph.node(*node);
                info!(
                    "reorder constant {} by {} (through {} rewrites)",
                    data.name,
                    perm,
                    history.len()
                );
                let permuted = match &data.op {
                    Op::Constant { value } => {
                        value.view().permuted_axes(perm.axes()).to_owned()
                    }
                    _ => {
                        return Err(Error::InvalidGraph(
                            "reorder target is not a constant".to_string(),
                        ))
                    }
                };
                match &mut graph.node_mut(*node).op {
                    Op::Constant { value } => *value = permuted,
                    _ => unreachable!(),
                }
                Ok(())
            }
            Action::ReorderInputDims {
                node,
                history,
                perm,
            } => {
                let data = graph.node(*node);
                info!(
                    "reorder input {} by {} (through {} rewrites)",
                    data.name,
                    perm,
                    history.len()
                );
                match &mut graph.node_mut(*node).op {
                    Op::Input { shape, .. } => {
                        *shape = perm.apply(shape);
                        Ok(())
                    }
                    _ => Err(Error::InvalidGraph(
                        "reorder target is not an input".to_string(),
                    )),
                }
            }
            Action::ReorderLinear {
                node,
                dir,
                flat_perm,
                qrec,
            } => {
                {
                    let linear = graph
                        .node_mut(*node)
                        .op
                        .linear_mut()
                        .ok_or_else(|| {
                            Error::InvalidGraph("reorder target is not a linear layer".to_string())
                        })?;
                    let (out_features, in_features) =
                        (linear.weights.shape()[0], linear.weights.shape()[1]);
                    match dir {
                        PortDir::In => {
                            if flat_perm.len() != in_features {
                                return Err(Error::InvalidGraph(
                                    "linear input reorder does not match weights".to_string(),
                                ));
                            }
                            let old = linear.weights.clone();
                            linear.weights =
                                ArrayD::from_shape_fn(IxDyn(&[out_features, in_features]), |ix| {
                                    old[[ix[0], flat_perm[ix[1]]]]
                                });
                        }
                        PortDir::Out => {
                            if flat_perm.len() != out_features {
                                return Err(Error::InvalidGraph(
                                    "linear output reorder does not match weights".to_string(),
                                ));
                            }
                            let old = linear.weights.clone();
                            linear.weights =
                                ArrayD::from_shape_fn(IxDyn(&[out_features, in_features]), |ix| {
                                    old[[flat_perm[ix[0]], ix[1]]]
                                });
                            if let Some(bias) = &mut linear.bias {
                                let permuted: Vec<f32> =
                                    flat_perm.iter().map(|&i| bias[i]).collect();
                                *bias = permuted;
                            }
                        }
                    }
                }
                if let (PortDir::Out, Some(key)) = (dir, qrec) {
                    if let Some(record) = graph.quantization.get_mut(key) {
                        if let Some(scales) = &mut record.channel_scales {
                            let permuted: Vec<f32> =
                                flat_perm.iter().map(|&i| scales[i]).collect();
                            *scales = permuted;
                        }
                    }
                }
                Ok(())
            }
            Action::SwitchBatchLinear { node } => {
                let linear = graph
                    .node_mut(*node)
                    .op
                    .linear_mut()
                    .ok_or_else(|| {
                        Error::InvalidGraph("switch-batch target is not a linear layer".to_string())
                    })?;
                linear.batch_minor = !linear.batch_minor;
                Ok(())
            }
            Action::TransposePad { node, perm } => match &mut graph.node_mut(*node).op {
                Op::Pad { padding } => {
                    *padding = perm.apply_slice(padding);
                    Ok(())
                }
                _ => Err(Error::InvalidGraph(
                    "transpose-pad target is not a pad".to_string(),
                )),
            },
            Action::TransposeReverse { node, perm } => match &mut graph.node_mut(*node).op {
                Op::Reverse { axis } => {
                    *axis = perm.position_of(*axis);
                    Ok(())
                }
                _ => Err(Error::InvalidGraph(
                    "transpose-reverse target is not a reverse".to_string(),
                )),
            },
            Action::TransposeConcat { node, perm } => match &mut graph.node_mut(*node).op {
                Op::Concat { axis } => {
                    *axis = perm.position_of(*axis);
                    Ok(())
                }
                _ => Err(Error::InvalidGraph(
                    "transpose-concat target is not a concat".to_string(),
                )),
            },
            Action::TransposeStridedSlice {
                node,
                perm,
                out_shape,
            } => match &mut graph.node_mut(*node).op {
                Op::StridedSlice {
                    specs,
                    slice_shape,
                    out_shape: existing_out,
                } => {
                    *specs = perm.apply_slice(specs);
                    *slice_shape = perm.apply(slice_shape);
                    *existing_out = match out_shape {
                        Some(shape) => shape.clone(),
                        None => slice_shape.clone(),
                    };
                    Ok(())
                }
                _ => Err(Error::InvalidGraph(
                    "transpose-slice target is not a strided slice".to_string(),
                )),
            },
            Action::EndUp { .. } | Action::EndDown { .. } => Ok(()),
        }
    }
}

/// Resolves the live edge an insertion should splice. Earlier actions in the
/// same batch may have replaced the captured edge, so fall back to the
/// current edge on the same port.
fn resolve_edge(
    graph: &NNGraph,
    node: NodeRef,
    dir: PortDir,
    idx: usize,
    dest: Option<Edge>,
) -> Result<Edge, Error> {
    match dir {
        PortDir::In => graph
            .indexed_in_edges(node)
            .get(idx)
            .copied()
            .ok_or_else(|| {
                Error::InvalidGraph(format!(
                    "'{}' has no input edge at port {}",
                    graph.node(node).name,
                    idx
                ))
            }),
        PortDir::Out => {
            let candidates: Vec<Edge> = graph
                .out_edges(node)
                .into_iter()
                .filter(|e| e.from_port == idx)
                .collect();
            if let Some(dest) = dest {
                if let Some(edge) = candidates.iter().find(|e| **e == dest) {
                    return Ok(*edge);
                }
            }
            candidates.first().copied().ok_or_else(|| {
                Error::InvalidGraph(format!(
                    "'{}' has no output edge at port {}",
                    graph.node(node).name,
                    idx
                ))
            })
        }
    }
}
