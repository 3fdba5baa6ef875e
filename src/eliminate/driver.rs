// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The elimination driver: enumerates transposes, races the upward and
//! downward explorers against each other, commits the best frontier, and
//! iterates to a fixpoint. Also hosts the structural cleanup that runs
//! between passes.

use crate::eliminate::actions::{Action, PortDir};
use crate::eliminate::search_down::search_down;
use crate::eliminate::search_up::search_up;
use crate::eliminate::visited::VisitedNodes;
use crate::eliminate::{CantContinue, TransposeHistory};
use crate::errors::Error;
use crate::graph::{NNGraph, NodeRef, Op};
use indexmap::IndexSet;
use log::info;

/// Passes after which a driver without a step limit declares itself stuck.
const MAX_PASSES: usize = 50;

/// Options controlling [`eliminate_transposes`].
pub struct EliminateOptions<'a> {
    /// Caps the number of driver passes. `None` runs to the fixpoint.
    pub steps: Option<usize>,
    /// Stop after the first successful commit.
    pub single_step: bool,
    /// Run the structural cleanup (no-op reshape removal, reshape and
    /// transpose fusion) after each pass.
    pub do_cleanup: bool,
    /// Disable downward exploration. Useful for diagnostics.
    pub only_up: bool,
    /// Called with the graph after each pass.
    pub debug_hook: Option<&'a mut dyn FnMut(&NNGraph)>,
}

impl Default for EliminateOptions<'_> {
    fn default() -> Self {
        Self {
            steps: None,
            single_step: false,
            do_cleanup: true,
            only_up: false,
            debug_hook: None,
        }
    }
}

impl std::fmt::Debug for EliminateOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EliminateOptions")
            .field("steps", &self.steps)
            .field("single_step", &self.single_step)
            .field("do_cleanup", &self.do_cleanup)
            .field("only_up", &self.only_up)
            .field("debug_hook", &self.debug_hook.is_some())
            .finish()
    }
}

/// Rewrites the graph so that as many transpose nodes as possible are
/// deleted, absorbed into layout-flexible neighbours, or pushed to the graph
/// edges.
///
/// Each pass enumerates the transpose nodes in name order, explores up and
/// down from each, scores both frontiers by transposes deleted minus
/// transposes inserted, and commits the winner. Upward elimination is
/// preferred on ties with a positive score since constants live upstream
/// and are cheap to re-permute statically; a zero-score downward move is
/// still taken when it pushes the transpose further down, which is what
/// guarantees the fixpoint. Shape inference re-runs after every pass.
pub fn eliminate_transposes(
    graph: &mut NNGraph,
    mut options: EliminateOptions<'_>,
) -> Result<(), Error> {
    info!("eliminating unnecessary transposes");
    let mut pass_count = 0usize;
    loop {
        match options.steps {
            Some(steps) if pass_count >= steps => break,
            None if pass_count >= MAX_PASSES => {
                return Err(Error::StuckInLoop { passes: pass_count })
            }
            _ => {}
        }
        pass_count += 1;
        let mut found_results = false;
        let mut visited_nodes: IndexSet<NodeRef> = IndexSet::new();
        let mut actions: Vec<Action> = Vec::new();
        info!("search for transposes +++ STEP {}", pass_count);

        let transposes = graph.nodes_filtered(|op| matches!(op, Op::Transpose { .. }));
        'transposes: for transpose_node in transposes {
            if visited_nodes.contains(&transpose_node) {
                continue;
            }
            let name = graph.node(transpose_node).name.clone();
            info!("++ trying to eliminate {}", name);

            let up = match try_up(graph, transpose_node, &visited_nodes) {
                Ok((mut up_actions, up_visited)) => {
                    up_actions.insert(
                        0,
                        Action::DeleteTranspose {
                            node: transpose_node,
                            reshape: None,
                        },
                    );
                    Some((up_actions, up_visited))
                }
                Err(_) => None,
            };
            let down = match try_down(graph, transpose_node, &visited_nodes, options.only_up) {
                Ok((mut down_actions, down_visited)) => {
                    down_actions.insert(
                        0,
                        Action::DeleteTranspose {
                            node: transpose_node,
                            reshape: None,
                        },
                    );
                    Some((down_actions, down_visited))
                }
                Err(_) => None,
            };

            info!("++ evaluate elimination of {}", name);
            let up_count = up.as_ref().map_or(-1, |(a, _)| count_eliminated(a));
            let down_count = down.as_ref().map_or(-1, |(a, _)| count_eliminated(a));

            // A count of zero means the transpose was merely re-anchored;
            // one is better since a real transpose was deleted rather than
            // traded. Always favor up over down: up is where constants are.
            if up_count > 0 && up_count >= down_count {
                info!(
                    "found elimination for {} upwards - {} eliminated",
                    name, up_count
                );
                found_results = true;
                let (up_actions, up_visited) = up.expect("scored above");
                visited_nodes.extend(up_visited.node_refs());
                visited_nodes.insert(transpose_node);
                actions.extend(up_actions);
                if options.single_step || options.steps.is_some() {
                    break 'transposes;
                }
            } else if down_count > 0
                || (down_count == 0
                    && transpose_moved(graph, &down.as_ref().expect("scored above").0))
            {
                info!(
                    "found elimination for {} downwards - {} eliminated",
                    name, down_count
                );
                found_results = true;
                let (down_actions, down_visited) = down.expect("scored above");
                visited_nodes.extend(down_visited.node_refs());
                visited_nodes.insert(transpose_node);
                actions.extend(down_actions);
                if options.single_step || options.steps.is_some() {
                    break 'transposes;
                }
            } else {
                info!("no elimination for {} found", name);
            }
        }

        if found_results {
            info!("eliminate transposes");
            for action in &actions {
                action.execute(graph)?;
            }
        } else {
            info!("no transposes to eliminate found");
        }
        if options.do_cleanup {
            remove_no_op_reshapes(graph)?;
            fuse_reshapes(graph)?;
            fuse_transposes(graph)?;
        }
        graph.add_dimensions()?;
        if let Some(hook) = options.debug_hook.as_mut() {
            hook(graph);
        }
        if !found_results {
            break;
        }
    }
    info!("no further transpose sequences found");
    Ok(())
}

fn try_up(
    graph: &NNGraph,
    transpose_node: NodeRef,
    visited_nodes: &IndexSet<NodeRef>,
) -> Result<(Vec<Action>, VisitedNodes), CantContinue> {
    let in_edge = *graph
        .indexed_in_edges(transpose_node)
        .first()
        .ok_or_else(|| CantContinue::new("transpose has no input"))?;
    if visited_nodes.contains(&in_edge.from) {
        return Err(CantContinue::new(
            "producer was claimed by a previous elimination",
        ));
    }
    let data = graph.node(transpose_node);
    info!("trying to eliminate {} upwards", data.name);
    let perm = match &data.op {
        Op::Transpose { perm } => perm.clone(),
        _ => return Err(CantContinue::new("not a transpose")),
    };
    let mut cur_visited = VisitedNodes::new();
    cur_visited.visit_up(transpose_node, 0);
    // Pushing a transpose up means propagating its inverse on the input
    // side.
    let seed = vec![TransposeHistory::new(
        transpose_node,
        data.out_dims[0].clone(),
        Some(perm.reverse()),
        data.in_dims[0].clone(),
    )];
    search_up(
        graph,
        in_edge.from,
        visited_nodes,
        &cur_visited,
        in_edge,
        &seed,
    )
}

fn try_down(
    graph: &NNGraph,
    transpose_node: NodeRef,
    visited_nodes: &IndexSet<NodeRef>,
    only_up: bool,
) -> Result<(Vec<Action>, VisitedNodes), CantContinue> {
    if only_up {
        return Err(CantContinue::new("downward exploration disabled"));
    }
    let data = graph.node(transpose_node);
    let perm = match &data.op {
        Op::Transpose { perm } => perm.clone(),
        _ => return Err(CantContinue::new("not a transpose")),
    };
    info!("trying to eliminate {} downwards", data.name);
    let mut cur_visited = VisitedNodes::new();
    cur_visited.visit_down(transpose_node, 0);
    let mut cur_actions = Vec::new();
    for edge in graph.out_edges(transpose_node) {
        if visited_nodes.contains(&edge.to) {
            return Err(CantContinue::new(
                "consumer was claimed by a previous elimination",
            ));
        }
        if cur_visited.contains(edge.to) {
            continue;
        }
        let seed = vec![TransposeHistory::new(
            transpose_node,
            data.in_dims[0].clone(),
            Some(perm.clone()),
            data.out_dims[0].clone(),
        )];
        let (new_actions, new_visited) = search_down(
            graph,
            edge.to,
            visited_nodes,
            &cur_visited,
            edge,
            &seed,
        )?;
        cur_actions.extend(new_actions);
        cur_visited.merge(&new_visited);
    }
    Ok((cur_actions, cur_visited))
}

/// Transposes deleted minus transposes inserted.
fn count_eliminated(actions: &[Action]) -> i64 {
    let deleted = actions
        .iter()
        .filter(|a| matches!(a, Action::DeleteTranspose { .. }))
        .count() as i64;
    let inserted = actions
        .iter()
        .filter(|a| matches!(a, Action::InsertTranspose { .. }))
        .count() as i64;
    deleted - inserted
}

/// With deletes and inserts balanced, did the transpose actually move
/// downstream? Measured by topological step indices.
fn transpose_moved(graph: &NNGraph, actions: &[Action]) -> bool {
    let insert_steps: usize = actions
        .iter()
        .filter_map(|a| match a {
            Action::InsertTranspose {
                node, dir, idx, ..
            } => Some(insert_step_idx(graph, *node, *dir, *idx)),
            _ => None,
        })
        .sum();
    let delete_steps: usize = actions
        .iter()
        .filter_map(|a| match a {
            Action::DeleteTranspose { node, .. } => Some(delete_step_idx(graph, *node)),
            _ => None,
        })
        .sum();
    insert_steps > delete_steps
}

fn insert_step_idx(graph: &NNGraph, node: NodeRef, dir: PortDir, idx: usize) -> usize {
    match dir {
        PortDir::In => {
            let mut edge = match graph.indexed_in_edges(node).get(idx) {
                Some(edge) => *edge,
                None => return graph.node(node).step_idx,
            };
            // Skip past transposes: one of them may be the one being
            // deleted.
            while matches!(graph.node(edge.from).op, Op::Transpose { .. }) {
                match graph.in_edges(edge.from).first() {
                    Some(previous) => edge = *previous,
                    None => break,
                }
            }
            graph.node(edge.from).step_idx
        }
        PortDir::Out => graph.node(node).step_idx,
    }
}

fn delete_step_idx(graph: &NNGraph, node: NodeRef) -> usize {
    graph
        .in_edges(node)
        .first()
        .map_or(0, |edge| graph.node(edge.from).step_idx)
}

/// Removes reshapes whose input and output shapes are identical.
pub(crate) fn remove_no_op_reshapes(graph: &mut NNGraph) -> Result<(), Error> {
    let silly = graph.nodes_filtered(|op| {
        matches!(op, Op::Reshape { old_shape, shape } if old_shape == shape)
    });
    for node in silly {
        graph.remove_and_reconnect(node)?;
    }
    Ok(())
}

/// Walks a single-fanout chain of fusion-transparent nodes from `edge`,
/// returning the terminating node if it matches.
fn chain_end(
    graph: &NNGraph,
    start: NodeRef,
    matches_end: impl Fn(&Op) -> bool + Copy,
) -> Option<NodeRef> {
    let edges = graph.out_edges(start);
    if edges.len() != 1 {
        return None;
    }
    let mut node = edges[0].to;
    loop {
        let op = &graph.node(node).op;
        if matches_end(op) {
            return Some(node);
        }
        if !op.is_fusion_transparent() {
            return None;
        }
        let edges = graph.out_edges(node);
        if edges.len() != 1 {
            return None;
        }
        node = edges[0].to;
    }
}

/// Finds (start, end) pairs of matching nodes connected through single-fanout
/// fusion-transparent chains. Each node takes part in at most one pair.
fn find_sequences(
    graph: &NNGraph,
    matches_end: impl Fn(&Op) -> bool + Copy,
) -> Vec<(NodeRef, NodeRef)> {
    let mut available: IndexSet<NodeRef> = graph.nodes_filtered(matches_end).into_iter().collect();
    let mut pairs = Vec::new();
    while let Some(node) = available.shift_remove_index(0) {
        if let Some(end) = chain_end(graph, node, matches_end) {
            pairs.push((node, end));
            available.shift_remove(&end);
        }
    }
    pairs
}

/// Fuses reshape pairs separated only by elementwise chains: the first
/// reshape takes over the second one's target shape.
pub(crate) fn fuse_reshapes(graph: &mut NNGraph) -> Result<(), Error> {
    loop {
        let pairs = find_sequences(graph, |op| matches!(op, Op::Reshape { .. }));
        if pairs.is_empty() {
            return Ok(());
        }
        for (start, end) in pairs {
            let target = match &graph.node(end).op {
                Op::Reshape { shape, .. } => shape.clone(),
                _ => continue,
            };
            info!(
                "combine reshapes {} and {}",
                graph.node(start).name,
                graph.node(end).name
            );
            if let Op::Reshape { shape, .. } = &mut graph.node_mut(start).op {
                *shape = target;
            }
            graph.remove_and_reconnect(end)?;
        }
    }
}

/// Fuses transpose pairs separated only by elementwise chains by composing
/// their permutations.
pub(crate) fn fuse_transposes(graph: &mut NNGraph) -> Result<(), Error> {
    loop {
        let pairs = find_sequences(graph, |op| matches!(op, Op::Transpose { .. }));
        if pairs.is_empty() {
            return Ok(());
        }
        for (start, end) in pairs {
            let second = match &graph.node(end).op {
                Op::Transpose { perm } => perm.clone(),
                _ => continue,
            };
            let combined = match &graph.node(start).op {
                Op::Transpose { perm } => perm.compose(&second),
                _ => continue,
            };
            info!(
                "combine transposes {} and {} -> {}",
                graph.node(start).name,
                graph.node(end).name,
                combined
            );
            if let Op::Transpose { perm } = &mut graph.node_mut(start).op {
                *perm = combined;
            }
            graph.remove_and_reconnect(end)?;
        }
    }
}
