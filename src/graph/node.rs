// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The closed operator taxonomy and its capability predicates.
//!
//! Operator kinds are a closed tagged variant. The elimination pass never
//! dispatches on concrete semantics beyond this enum; everything it needs to
//! know is expressed by the capability predicates below
//! (`is_sensitive_to_order`, `is_broadcastable`, `is_transient`).

use crate::shape::{Perm, Shape};
use ndarray::ArrayD;

/// A binary arithmetic operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinaryOp {
    /// Elementwise addition.
    Add,
    /// Elementwise subtraction.
    Sub,
    /// Elementwise multiplication.
    Mul,
    /// Elementwise division.
    Div,
}

/// A unary elementwise operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnaryOp {
    /// Negation.
    Neg,
    /// Absolute value.
    Abs,
}

/// An activation function.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActivationKind {
    /// Rectified linear unit.
    Relu,
    /// Logistic sigmoid.
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
}

/// A global pooling reduction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolingKind {
    /// Mean over the spatial axes.
    Mean,
    /// Maximum over the spatial axes.
    Max,
}

/// Per-axis slice specification: `(begin, end, stride)` with `end` exclusive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SliceSpec {
    /// First element taken.
    pub begin: usize,
    /// One past the last element considered.
    pub end: usize,
    /// Step between taken elements.
    pub stride: usize,
}

impl SliceSpec {
    /// A slice taking a whole axis of the given dimension.
    pub fn full(dim: usize) -> Self {
        Self {
            begin: 0,
            end: dim,
            stride: 1,
        }
    }

    /// The number of elements this slice produces.
    pub fn len(&self) -> usize {
        if self.end <= self.begin {
            0
        } else {
            (self.end - self.begin + self.stride - 1) / self.stride
        }
    }
}

/// The weights of a linear (fully-connected) layer.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearAttrs {
    /// Weight matrix, `[out_features, in_features]`.
    pub weights: ArrayD<f32>,
    /// Optional per-output-feature bias.
    pub bias: Option<Vec<f32>>,
    /// Number of batch rows the layer multiplies at once.
    pub batch_size: usize,
    /// True when the layer emits its output batch-minor, i.e. `[out, batch]`
    /// instead of `[batch, out]`. Toggled by the batch-switch rewrite.
    pub batch_minor: bool,
}

impl LinearAttrs {
    /// Number of output features.
    pub fn out_features(&self) -> usize {
        self.weights.shape()[0]
    }

    /// Number of input features per batch row.
    pub fn in_features(&self) -> usize {
        self.weights.shape()[1]
    }
}

/// An operator kind together with its kind-specific attributes.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// A graph input with a declared shape.
    Input {
        /// Declared shape of the data fed into the graph.
        shape: Shape,
        /// When set, the caller's data layout is frozen and the pass may not
        /// reorder the input's dimensions.
        fixed_order: bool,
    },
    /// A graph output.
    Output {
        /// When set, the consumer's expected layout is frozen.
        fixed_order: bool,
    },
    /// A constant tensor baked into the graph.
    Constant {
        /// The stored value.
        value: ArrayD<f32>,
    },
    /// An axis permutation.
    Transpose {
        /// The permutation applied to the input.
        perm: Perm,
    },
    /// A data-preserving shape reinterpretation.
    Reshape {
        /// Shape consumed.
        old_shape: Shape,
        /// Shape produced.
        shape: Shape,
    },
    /// Zero padding, per axis.
    Pad {
        /// `(before, after)` padding per axis.
        padding: Vec<(usize, usize)>,
    },
    /// Reversal of a single axis.
    Reverse {
        /// The reversed axis.
        axis: usize,
    },
    /// A strided slice, possibly combined with a reshape.
    StridedSlice {
        /// Per-axis slice specification.
        specs: Vec<SliceSpec>,
        /// Shape right after slicing.
        slice_shape: Shape,
        /// Shape produced; differs from `slice_shape` when the slice also
        /// reshapes.
        out_shape: Shape,
    },
    /// Concatenation along an axis.
    Concat {
        /// The concatenation axis.
        axis: usize,
    },
    /// A broadcastable binary arithmetic operator.
    Binary {
        /// The arithmetic operation.
        op: BinaryOp,
    },
    /// Broadcastable elementwise power.
    Pow,
    /// An elementwise activation function.
    Activation {
        /// The activation kind.
        kind: ActivationKind,
    },
    /// An identity copy.
    Copy,
    /// An elementwise unary operator.
    Unary {
        /// The unary operation.
        op: UnaryOp,
    },
    /// Softmax along an axis. Sensitive to axis order.
    Softmax {
        /// The normalization axis.
        axis: usize,
    },
    /// A 2-d convolution over NCHW data. Sensitive to axis order.
    Conv {
        /// Filter weights, `[out_channels, in_channels, kh, kw]`.
        weights: ArrayD<f32>,
        /// Spatial stride `(h, w)`.
        stride: (usize, usize),
        /// Spatial zero padding `(h, w)`, applied on both sides.
        padding: (usize, usize),
    },
    /// Global pooling over the spatial axes. Sensitive to axis order.
    GlobalPooling {
        /// The reduction kind.
        kind: PoolingKind,
    },
    /// A fully-connected layer.
    FullyConnected {
        /// The layer weights and batch handling.
        linear: LinearAttrs,
    },
    /// A fully-connected layer fused with an activation.
    LinearFusion {
        /// The contained linear layer.
        linear: LinearAttrs,
        /// The fused activation.
        activation: ActivationKind,
    },
}

impl Op {
    /// A short name for the operator kind, used in generated node names and
    /// log messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Output { .. } => "output",
            Op::Constant { .. } => "constant",
            Op::Transpose { .. } => "transpose",
            Op::Reshape { .. } => "reshape",
            Op::Pad { .. } => "pad",
            Op::Reverse { .. } => "reverse",
            Op::StridedSlice { .. } => "strided_slice",
            Op::Concat { .. } => "concat",
            Op::Binary { .. } => "binary",
            Op::Pow => "pow",
            Op::Activation { .. } => "activation",
            Op::Copy => "copy",
            Op::Unary { .. } => "unary",
            Op::Softmax { .. } => "softmax",
            Op::Conv { .. } => "conv",
            Op::GlobalPooling { .. } => "global_pooling",
            Op::FullyConnected { .. } => "linear",
            Op::LinearFusion { .. } => "linear_fusion",
        }
    }

    /// True for operators whose numerical result depends on the physical
    /// ordering of their input axes. Propagation terminates at these.
    pub fn is_sensitive_to_order(&self) -> bool {
        matches!(
            self,
            Op::Softmax { .. } | Op::Conv { .. } | Op::GlobalPooling { .. }
        )
    }

    /// True for operators that accept inputs of differing ranks by implicitly
    /// prepending unit axes.
    pub fn is_broadcastable(&self) -> bool {
        matches!(self, Op::Binary { .. } | Op::Pow)
    }

    /// True for operators whose semantics are parameterised by axis
    /// attributes, so a permutation commutes past them by rewriting those
    /// attributes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Op::Pad { .. } | Op::Reverse { .. } | Op::StridedSlice { .. } | Op::Concat { .. }
        )
    }

    /// True for operators whose sibling inputs must all carry a compatible
    /// permutation, forcing the downward explorer to recurse upwards into
    /// them.
    pub fn explores_up(&self) -> bool {
        matches!(self, Op::Concat { .. } | Op::Binary { .. } | Op::Pow)
    }

    /// True for the terminals that can absorb a permutation outright:
    /// constants, unfrozen inputs and outputs, and single-batch linear
    /// layers. These stay visitable even when the opposite frontier already
    /// went through them.
    pub fn is_layout_flexible(&self) -> bool {
        match self {
            Op::Input { fixed_order, .. } | Op::Output { fixed_order } => !fixed_order,
            Op::Constant { .. } => true,
            Op::FullyConnected { linear } | Op::LinearFusion { linear, .. } => {
                linear.batch_size == 1
            }
            _ => false,
        }
    }

    /// True for the elementwise operators that reshape and transpose fusion
    /// may walk through during cleanup.
    pub fn is_fusion_transparent(&self) -> bool {
        matches!(
            self,
            Op::Copy | Op::Unary { .. } | Op::Activation { .. }
        )
    }

    /// Returns the linear attributes for linear-like operators.
    pub fn linear(&self) -> Option<&LinearAttrs> {
        match self {
            Op::FullyConnected { linear } | Op::LinearFusion { linear, .. } => Some(linear),
            _ => None,
        }
    }

    /// Mutable access to the linear attributes for linear-like operators.
    pub fn linear_mut(&mut self) -> Option<&mut LinearAttrs> {
        match self {
            Op::FullyConnected { linear } | Op::LinearFusion { linear, .. } => Some(linear),
            _ => None,
        }
    }
}
