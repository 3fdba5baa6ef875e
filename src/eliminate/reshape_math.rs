// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reshape reasoner: the single source of truth for how a permutation
//! interacts with a reshape.
//!
//! Given a permutation acting on one side of a reshape, [`reverse_reshape`]
//! computes the equivalent permutation on the other side, together with the
//! reshape's rewritten shapes, or reports that no compatible permutation
//! exists. A permutation commutes with a reshape exactly when every group of
//! axes the reshape merges or splits travels through the permutation as one
//! contiguous, order-preserving block; anything else would interleave data.

use crate::shape::{Perm, Shape};

/// Pushes `perm` across the reshape `old_shape -> new_shape`.
///
/// The permutation is understood to act on the reshape's input side when
/// going down and on its output side when going up. Returns the far-side
/// permutation (or `None` when the reshape genuinely interleaves permuted
/// data) and the reshape's adjusted `(input, output)` shapes.
pub(crate) fn reverse_reshape(
    perm: &Perm,
    old_shape: &Shape,
    new_shape: &Shape,
    going_up: bool,
) -> (Option<Perm>, Option<Shape>, Option<Shape>) {
    if going_up {
        debug_assert_eq!(perm.rank(), new_shape.rank());
        let adjusted_out = perm.reverse().apply(new_shape);
        match push_through(perm, new_shape, old_shape) {
            Some((far_perm, adjusted_in)) => {
                (Some(far_perm), Some(adjusted_in), Some(adjusted_out))
            }
            None => (None, Some(old_shape.clone()), Some(adjusted_out)),
        }
    } else {
        debug_assert_eq!(perm.rank(), old_shape.rank());
        let adjusted_in = perm.reverse().apply(old_shape);
        match push_through(perm, old_shape, new_shape) {
            Some((far_perm, adjusted_out)) => {
                (Some(far_perm), Some(adjusted_in), Some(adjusted_out))
            }
            None => (None, Some(adjusted_in), Some(new_shape.clone())),
        }
    }
}

/// Core of the reasoner: `perm` acts on side `a` of a reshape `a -> b`.
/// Returns the equivalent permutation on side `b` and side `b`'s adjusted
/// shape, or `None` when the permutation does not commute with the reshape.
fn push_through(perm: &Perm, a_shape: &Shape, b_shape: &Shape) -> Option<(Perm, Shape)> {
    // Unit axes carry no data; strip them and deal with them again at the
    // end. The stripped permutation relates the non-unit axes of both sides.
    let a_units: Vec<usize> = (0..a_shape.rank())
        .filter(|&i| a_shape[i] == 1)
        .map(|i| perm.axes()[i])
        .collect();
    let stripped = perm.strip_axes(&a_units);

    let a_nz: Vec<usize> = a_shape.dims().iter().copied().filter(|&d| d != 1).collect();
    let b_nz: Vec<usize> = b_shape.dims().iter().copied().filter(|&d| d != 1).collect();

    // Minimal common segmentation by running products. All dims are >= 2
    // here, so the boundaries are canonical.
    let mut segments: Vec<(std::ops::Range<usize>, std::ops::Range<usize>)> = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a_nz.len() && j < b_nz.len() {
        let (seg_i, seg_j) = (i, j);
        let mut prod_a = a_nz[i];
        let mut prod_b = b_nz[j];
        i += 1;
        j += 1;
        while prod_a != prod_b {
            if prod_a < prod_b {
                prod_a *= *a_nz.get(i)?;
                i += 1;
            } else {
                prod_b *= *b_nz.get(j)?;
                j += 1;
            }
        }
        segments.push((seg_i..i, seg_j..j));
    }
    if i < a_nz.len() || j < b_nz.len() {
        return None;
    }

    // Each segment's source axes must form one ascending, contiguous block.
    for (a_range, _) in &segments {
        let sources = &stripped.axes()[a_range.clone()];
        if sources.windows(2).any(|w| w[1] != w[0] + 1) {
            return None;
        }
    }

    // Order segments by where their block sits on the far side of the
    // permutation; that order is the segment order of the adjusted shape.
    let mut order: Vec<usize> = (0..segments.len()).collect();
    order.sort_by_key(|&s| stripped.axes()[segments[s].0.start]);

    // Stripped far-side permutation: for each non-unit axis of `b`, the
    // position its segment block occupies in the adjusted shape.
    let mut offsets = vec![0usize; segments.len()];
    let mut offset = 0;
    for &s in &order {
        offsets[s] = offset;
        offset += segments[s].1.len();
    }
    let mut far_stripped = vec![0usize; b_nz.len()];
    for (s, (_, b_range)) in segments.iter().enumerate() {
        for (d, q) in b_range.clone().enumerate() {
            far_stripped[q] = offsets[s] + d;
        }
    }

    // Re-insert `b`'s unit axes in place.
    let b_nz_pos = b_shape.non_unit_positions();
    let mut strip_index = vec![usize::MAX; b_shape.rank()];
    for (q, &pos) in b_nz_pos.iter().enumerate() {
        strip_index[pos] = q;
    }
    let far_perm = Perm::new((0..b_shape.rank()).map(|pos| {
        if b_shape[pos] == 1 {
            pos
        } else {
            b_nz_pos[far_stripped[strip_index[pos]]]
        }
    }));

    let adjusted_b = far_perm.reverse().apply(b_shape);
    Some((far_perm, adjusted_b))
}
