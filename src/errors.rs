// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contains types that describe errors that `minnow` methods can return.

use std::error;
use std::fmt;

use Error::*;

/// Error type describing the sorts of errors `minnow` can return.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The graph under construction or mutation is structurally invalid.
    InvalidGraph(String),
    /// Shape inference failed while re-deriving node dimensions.
    ShapeInference(String),
    /// The reference evaluator could not execute a node.
    Execution(String),
    /// The elimination driver made no net progress for too many passes.
    ///
    /// This indicates a bug in the pass; please report it.
    StuckInLoop {
        /// The number of passes that ran before giving up.
        passes: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidGraph(msg) => write!(f, "Invalid graph: {}", msg),
            ShapeInference(msg) => write!(f, "Error while inferring shapes: {}", msg),
            Execution(msg) => write!(f, "Error while executing graph: {}", msg),
            StuckInLoop { passes } => write!(
                f,
                "Sorry, eliminate transposes seems to be stuck in a loop after {} passes. \
                 Please report this.",
                passes
            ),
        }
    }
}

impl error::Error for Error {}
