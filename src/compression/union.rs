//! Packing dense gradients at the union of every rank's selection.
//!
//! Once the selection masks are or-reduced across ranks, all ranks agree on
//! which positions carry a value. Each rank packs its dense values at those
//! positions into a buffer of the same layout, so a sum all-reduce over the
//! packed buffer gives the same result as one over the full gradient.

use crate::device::{LaunchConfig, for_each_lane};
use crate::element::Element;
use crate::memory::LaneSlice;

/// Exclusive prefix count of set bits: `offsets[w]` is `base` plus the bits
/// set in `mask[..w]`.
///
/// Returns `base` plus every bit set in `mask`.
pub fn mask_offsets(mask: &[u32], base: u64, offsets: &mut [u64]) -> u64 {
    let mut next = base;
    for (word, offset) in mask.iter().zip(offsets.iter_mut()) {
        *offset = next;
        next += u64::from(word.count_ones());
    }
    next
}

/// Visit the set bits of `word` in increasing order as `(element, slot)`.
#[inline]
fn for_each_bit(word: u32, w: usize, first_slot: usize, mut f: impl FnMut(usize, usize)) {
    let mut bits = word;
    let mut slot = first_slot;
    while bits != 0 {
        f(w * 32 + bits.trailing_zeros() as usize, slot);
        slot += 1;
        bits &= bits - 1;
    }
}

/// `packed[offsets[w] + k] = dense[32 * w + b]` where `b` is the `k`-th set
/// bit of `mask[w]`.
pub fn gather_masked<T: Element>(
    launch: LaunchConfig,
    mask: &[u32],
    offsets: &[u64],
    dense: &[T],
    packed: &mut [T],
) {
    let packed = LaneSlice::new(packed);
    for_each_lane(launch, mask.len().min(offsets.len()), |w| {
        for_each_bit(mask[w], w, offsets[w] as usize, |i, slot| {
            if i < dense.len() && slot < packed.len() {
                // SAFETY: word `w` owns slots `offsets[w]..offsets[w + 1]`.
                unsafe { packed.write(slot, dense[i]) };
            }
        });
    });
}

/// Inverse of [`gather_masked`]: `dense[32 * w + b] = packed[offsets[w] + k]`.
///
/// Positions outside the mask are left untouched.
pub fn scatter_masked<T: Element>(
    launch: LaunchConfig,
    mask: &[u32],
    offsets: &[u64],
    packed: &[T],
    dense: &mut [T],
) {
    let dense = LaneSlice::new(dense);
    for_each_lane(launch, mask.len().min(offsets.len()), |w| {
        for_each_bit(mask[w], w, offsets[w] as usize, |i, slot| {
            if i < dense.len() && slot < packed.len() {
                // SAFETY: word `w` owns elements `32 * w..32 * w + 32`.
                unsafe { dense.write(i, packed[slot]) };
            }
        });
    });
}
