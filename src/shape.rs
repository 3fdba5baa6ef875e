// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tensor shapes and axis permutations.
//!
//! A [`Perm`] is an ordering of source axes: applying `p` to a shape produces
//! a shape whose `i`-th dimension is `shape[p[i]]`. All of the transpose
//! algebra used by the elimination pass lives here.

use smallvec::SmallVec;
use std::fmt;
use std::ops::Index;

type Dims = SmallVec<[usize; 6]>;

/// The logical shape of a tensor: an ordered list of positive dimensions.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Shape {
    dims: Dims,
}

impl Shape {
    /// Creates a new shape from a list of dimensions.
    pub fn new(dims: impl IntoIterator<Item = usize>) -> Self {
        Self {
            dims: dims.into_iter().collect(),
        }
    }

    /// Creates a rank-0 shape. Mostly useful as a placeholder before shape
    /// inference has run.
    pub fn scalar() -> Self {
        Self { dims: Dims::new() }
    }

    /// Returns the number of axes.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns the dimensions as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the total number of elements.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns the layout shape: the logical shape with unit axes elided.
    ///
    /// The layout shape describes the physical memory order; permuting only
    /// unit axes changes the logical shape but not the layout shape. At least
    /// one axis always survives.
    pub fn layout_shape(&self) -> Shape {
        let mut dims: Dims = self.dims.iter().copied().filter(|&d| d != 1).collect();
        if dims.is_empty() && !self.dims.is_empty() {
            dims.push(1);
        }
        Shape { dims }
    }

    /// Strips leading unit axes, keeping at least one axis.
    pub fn strip_leading_units(&self) -> Shape {
        let mut start = 0;
        while start + 1 < self.dims.len() && self.dims[start] == 1 {
            start += 1;
        }
        Shape::new(self.dims[start..].iter().copied())
    }

    /// Prepends `count` unit axes.
    pub fn prepend_units(&self, count: usize) -> Shape {
        Shape::new(
            std::iter::repeat(1)
                .take(count)
                .chain(self.dims.iter().copied()),
        )
    }

    /// Positions of the axes whose dimension is not 1.
    pub(crate) fn non_unit_positions(&self) -> Vec<usize> {
        self.dims
            .iter()
            .enumerate()
            .filter(|(_, &d)| d != 1)
            .map(|(i, _)| i)
            .collect()
    }
}

impl Index<usize> for Shape {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        &self.dims[index]
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.iter().copied())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for dim in &self.dims {
            if !first {
                write!(f, "x")?;
            }
            write!(f, "{}", dim)?;
            first = false;
        }
        Ok(())
    }
}

/// An axis permutation: a sequence of distinct integers in `[0, n)`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Perm {
    axes: Dims,
}

impl Perm {
    /// Creates a new permutation.
    ///
    /// Panics in debug builds if the axes are not a permutation of `0..n`.
    pub fn new(axes: impl IntoIterator<Item = usize>) -> Self {
        let axes: Dims = axes.into_iter().collect();
        debug_assert!(
            {
                let mut sorted: Vec<_> = axes.iter().copied().collect();
                sorted.sort_unstable();
                sorted.iter().copied().eq(0..axes.len())
            },
            "{:?} is not a permutation",
            axes
        );
        Self { axes }
    }

    /// The identity permutation of the given rank.
    pub fn identity(rank: usize) -> Self {
        Self {
            axes: (0..rank).collect(),
        }
    }

    /// Returns the number of axes.
    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    /// Returns the axes as a slice.
    pub fn axes(&self) -> &[usize] {
        &self.axes
    }

    /// Applies this permutation to a shape: `out[i] = shape[self[i]]`.
    pub fn apply(&self, shape: &Shape) -> Shape {
        debug_assert_eq!(self.rank(), shape.rank());
        Shape::new(self.axes.iter().map(|&a| shape[a]))
    }

    /// Applies this permutation to any indexed sequence, such as a per-axis
    /// attribute list.
    pub fn apply_slice<T: Clone>(&self, seq: &[T]) -> Vec<T> {
        debug_assert_eq!(self.rank(), seq.len());
        self.axes.iter().map(|&a| seq[a].clone()).collect()
    }

    /// Returns the inverse permutation, such that
    /// `p.reverse().apply(&p.apply(&s)) == s`.
    pub fn reverse(&self) -> Perm {
        let mut axes: Dims = SmallVec::from_elem(0, self.axes.len());
        for (i, &a) in self.axes.iter().enumerate() {
            axes[a] = i;
        }
        Perm { axes }
    }

    /// Composes two permutations: applying `self` and then `then` is the same
    /// as applying `self.compose(&then)` once.
    pub fn compose(&self, then: &Perm) -> Perm {
        debug_assert_eq!(self.rank(), then.rank());
        Perm {
            axes: then.axes.iter().map(|&a| self.axes[a]).collect(),
        }
    }

    /// Returns true if this is the identity permutation.
    pub fn is_identity(&self) -> bool {
        self.axes.iter().copied().eq(0..self.axes.len())
    }

    /// Returns the position `i` such that `self[i] == axis`.
    pub fn position_of(&self, axis: usize) -> usize {
        self.axes
            .iter()
            .position(|&a| a == axis)
            .expect("axis out of range for permutation")
    }

    /// Returns true if applying this permutation to data of the given shape
    /// leaves the memory layout unchanged.
    ///
    /// That is the case exactly when the non-unit axes keep their relative
    /// order; unit axes can move freely without touching the data.
    pub fn does_nothing(&self, shape: &Shape) -> bool {
        if self.rank() != shape.rank() {
            return false;
        }
        let moved: Vec<usize> = self
            .axes
            .iter()
            .copied()
            .filter(|&a| shape[a] != 1)
            .collect();
        moved.windows(2).all(|w| w[0] < w[1])
    }

    /// Removes the given source axes from the permutation, rebasing each
    /// surviving value by the number of removed axes less than it.
    pub fn strip_axes(&self, removed: &[usize]) -> Perm {
        let axes: Dims = self
            .axes
            .iter()
            .filter(|&&a| !removed.contains(&a))
            .map(|&a| a - removed.iter().filter(|&&r| r < a).count())
            .collect();
        Perm { axes }
    }

    /// Prepends `count` new leading axes, shifting all existing values up.
    pub fn expand_axes(&self, count: usize) -> Perm {
        Perm {
            axes: (0..count)
                .chain(self.axes.iter().map(|&a| a + count))
                .collect(),
        }
    }
}

impl<const N: usize> From<[usize; N]> for Perm {
    fn from(axes: [usize; N]) -> Self {
        Perm::new(axes)
    }
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut first = true;
        for axis in &self.axes {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", axis)?;
            first = false;
        }
        write!(f, ")")
    }
}

/// The axes a smaller shape gains when broadcast against a larger one:
/// `0..larger.rank() - smaller.rank()`.
pub fn broadcast_axes(smaller: &Shape, larger: &Shape) -> Vec<usize> {
    (0..larger.rank().saturating_sub(smaller.rank())).collect()
}

/// The elementwise maximum of a set of same-rank shapes.
pub fn max_shape(shapes: &[Shape]) -> Shape {
    if shapes.len() == 1 {
        return shapes[0].clone();
    }
    let rank = shapes.iter().map(Shape::rank).max().unwrap_or(0);
    Shape::new((0..rank).map(|i| {
        shapes
            .iter()
            .filter(|s| i < s.rank())
            .map(|s| s[i])
            .max()
            .unwrap_or(1)
    }))
}

/// The row-major flat index permutation induced by transposing data of
/// `shape` with `perm`: entry `j` is the flat position in the untransposed
/// data of the element at flat position `j` of the transposed data.
pub(crate) fn flat_permutation(perm: &Perm, shape: &Shape) -> Vec<usize> {
    let transposed = perm.apply(shape);
    let rank = shape.rank();
    // Row-major strides of the untransposed shape.
    let mut strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    let mut out = Vec::with_capacity(shape.num_elements());
    let mut index = vec![0usize; rank];
    loop {
        let flat: usize = index
            .iter()
            .enumerate()
            .map(|(i, &m)| m * strides[perm.axes()[i]])
            .sum();
        out.push(flat);
        // Advance the multi-index over the transposed shape.
        let mut axis = rank;
        loop {
            if axis == 0 {
                return out;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < transposed[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}
