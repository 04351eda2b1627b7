//! Turning compacted pairs back into dense gradients, plus the bookkeeping
//! passes that go with it.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::device::{LaunchConfig, for_each_lane};
use crate::element::{Element, Gradient};
use crate::memory::LaneSlice;

/// Set every element of `out` to `value`.
pub fn fill<T: Element>(launch: LaunchConfig, out: &mut [T], value: T) {
    let n = out.len();
    let lanes = LaneSlice::new(out);
    for_each_lane(launch, n, |i| {
        // SAFETY: lane `i` owns index `i`.
        unsafe { lanes.write(i, value) };
    });
}

/// `out[indices[j]] = values[j]` for every valid pair.
///
/// Indices within one compacted layer are distinct, so lanes never collide.
pub fn scatter<T: Gradient>(launch: LaunchConfig, values: &[T], indices: &[u32], out: &mut [T]) {
    let lanes = LaneSlice::new(out);
    for_each_lane(launch, values.len().min(indices.len()), |j| {
        let idx = indices[j];
        let v = values[j];
        if idx.is_valid() && v.is_valid() && (idx as usize) < lanes.len() {
            // SAFETY: compacted indices are unique within a layer.
            unsafe { lanes.write(idx as usize, v) };
        }
    });
}

/// `out[indices[j]] += values[j]` for every valid pair of one rank's layer.
pub fn scatter_add<T: Gradient>(launch: LaunchConfig, values: &[T], indices: &[u32], out: &mut [T]) {
    let lanes = LaneSlice::new(out);
    for_each_lane(launch, values.len().min(indices.len()), |j| {
        let idx = indices[j];
        let v = values[j];
        if idx.is_valid() && v.is_valid() && (idx as usize) < lanes.len() {
            // SAFETY: compacted indices are unique within a layer.
            unsafe { lanes.write(idx as usize, lanes.read(idx as usize) + v) };
        }
    });
}

/// Set bit `indices[j]` in `mask` for every valid index.
pub fn mark_selected(launch: LaunchConfig, indices: &[u32], mask: &[AtomicU32]) {
    for_each_lane(launch, indices.len(), |j| {
        let idx = indices[j];
        if idx.is_valid() && ((idx / 32) as usize) < mask.len() {
            mask[(idx / 32) as usize].fetch_or(1 << (idx % 32), Ordering::Relaxed);
        }
    });
}

/// Number of `u32` words a bitmask over `n` elements needs.
pub fn mask_words(n: usize) -> usize {
    n.div_ceil(32)
}
