// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::eliminate::reshape_math::reverse_reshape;
use crate::shape::{Perm, Shape};
use pretty_assertions::assert_eq;

#[test]
fn pushes_through_axis_merge() {
    // x --T(0,2,3,1)--> [1,4,5,3] --reshape--> [20,3] commutes to
    // x --reshape [1,3,4,5]->[3,20]--> --T(1,0)-->.
    let (perm, from_shape, to_shape) = reverse_reshape(
        &Perm::new([0, 2, 3, 1]),
        &Shape::from([1, 4, 5, 3]),
        &Shape::from([20, 3]),
        false,
    );
    assert_eq!(perm, Some(Perm::new([1, 0])));
    assert_eq!(from_shape, Some(Shape::from([1, 3, 4, 5])));
    assert_eq!(to_shape, Some(Shape::from([3, 20])));
}

#[test]
fn pushes_up_through_axis_merge() {
    // The inverse of the downward case: pushing (1,0) back up through the
    // same reshape reconstructs the original four-axis permutation.
    let (perm, from_shape, to_shape) = reverse_reshape(
        &Perm::new([1, 0]),
        &Shape::from([1, 4, 5, 3]),
        &Shape::from([20, 3]),
        true,
    );
    assert_eq!(perm, Some(Perm::new([0, 2, 3, 1])));
    assert_eq!(from_shape, Some(Shape::from([1, 3, 4, 5])));
    assert_eq!(to_shape, Some(Shape::from([3, 20])));
}

#[test]
fn pushes_through_axis_split() {
    // Swapping [6,5] then splitting 6 into 2x3 moves the split pair as one
    // block.
    let (perm, from_shape, to_shape) = reverse_reshape(
        &Perm::new([1, 0]),
        &Shape::from([6, 5]),
        &Shape::from([2, 3, 5]),
        false,
    );
    assert_eq!(perm, Some(Perm::new([1, 2, 0])));
    assert_eq!(from_shape, Some(Shape::from([5, 6])));
    assert_eq!(to_shape, Some(Shape::from([5, 2, 3])));
}

#[test]
fn rejects_interleaving_flatten() {
    // Transposing [2,3] and then flattening interleaves the data; there is
    // no output-side permutation.
    let (perm, from_shape, to_shape) = reverse_reshape(
        &Perm::new([1, 0]),
        &Shape::from([2, 3]),
        &Shape::from([6]),
        false,
    );
    assert_eq!(perm, None);
    assert_eq!(from_shape, Some(Shape::from([3, 2])));
    assert_eq!(to_shape, Some(Shape::from([6])));
}

#[test]
fn unit_axes_move_freely() {
    // Only the unit axis moves, so the permutation survives elision of the
    // unit axis as the identity.
    let (perm, from_shape, to_shape) = reverse_reshape(
        &Perm::new([1, 0]),
        &Shape::from([3, 1]),
        &Shape::from([3]),
        false,
    );
    assert_eq!(perm, Some(Perm::identity(1)));
    assert_eq!(from_shape, Some(Shape::from([1, 3])));
    assert_eq!(to_shape, Some(Shape::from([3])));
}

#[test]
fn keeps_untouched_groups_in_place() {
    // A permutation that only reorders axes inside segment boundaries in an
    // order-preserving way passes through unchanged.
    let (perm, from_shape, to_shape) = reverse_reshape(
        &Perm::identity(3),
        &Shape::from([2, 3, 5]),
        &Shape::from([6, 5]),
        false,
    );
    assert_eq!(perm, Some(Perm::identity(2)));
    assert_eq!(from_shape, Some(Shape::from([2, 3, 5])));
    assert_eq!(to_shape, Some(Shape::from([6, 5])));
}

#[test]
fn rejects_block_breaking_permutation() {
    // [4,3,5]: moving 3 away from 4 breaks the 4x3 block that the reshape
    // merges into 12.
    let (perm, _, to_shape) = reverse_reshape(
        &Perm::new([0, 2, 1]),
        &Shape::from([4, 3, 5]),
        &Shape::from([12, 5]),
        false,
    );
    assert_eq!(perm, None);
    assert_eq!(to_shape, Some(Shape::from([12, 5])));
}
