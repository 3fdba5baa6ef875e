// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rewrite neural-network operator graphs to eliminate tensor layout
//! transposes.
//!
//! Every axis-permutation node that survives graph compilation becomes a
//! runtime data shuffle on the target accelerator. `minnow` rewrites a graph
//! into an equivalent one with as few transpose nodes as possible: it
//! deletes cancelling pairs, bakes permutations into constants, inputs and
//! linear-layer weights, pushes them through reshapes, pads, slices and
//! broadcasts, and re-anchors whatever remains directly in front of the
//! order-sensitive operators that force a shuffle.
//!
//! # Examples
//!
//! A pair of transposes that cancel each other disappears entirely:
//!
//! ```
//! use minnow::graph::GraphBuilder;
//! use minnow::{eliminate_transposes, EliminateOptions};
//!
//! let mut builder = GraphBuilder::new();
//! let input = builder.input("input", [1, 3, 4, 5]);
//! let first = builder.transpose("first", [0, 2, 3, 1]);
//! let second = builder.transpose("second", [0, 3, 1, 2]);
//! let output = builder.output("output");
//! builder.edge(input, first);
//! builder.edge(first, second);
//! builder.edge(second, output);
//! let mut graph = builder.build().unwrap();
//!
//! eliminate_transposes(&mut graph, EliminateOptions::default()).unwrap();
//!
//! assert_eq!(graph.transpose_count(), 0);
//! ```

#![warn(missing_docs)]

mod eliminate;
pub mod errors;
pub mod graph;
mod shape;
#[cfg(test)]
mod unit_tests;

pub use eliminate::{eliminate_transposes, EliminateOptions};
pub use errors::Error;
pub use shape::{broadcast_axes, max_shape, Perm, Shape};
