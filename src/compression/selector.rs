//! Threshold selection with block-aggregated slot claiming.
//!
//! Every block counts the elements of its tile that pass the threshold,
//! claims that many output slots with a single `fetch_add` on the layer's
//! counter, then writes its pairs into the claimed range. Slots at or beyond
//! the output capacity are dropped, but the counter still records the true
//! number of matches.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::device::{LaunchConfig, for_each_block};
use crate::element::Gradient;
use crate::memory::LaneSlice;

use super::threshold::threshold_rank;

#[inline]
fn passes<T: Gradient>(x: T, threshold: T) -> bool {
    x.abs() >= threshold
}

/// Where one layer's selected pairs go.
pub struct SelectOutput<'a, T> {
    pub values: LaneSlice<'a, T>,
    pub indices: LaneSlice<'a, u32>,
    pub counter: &'a AtomicU32,
}

/// Compact every `values[i]` with `|values[i]| >= threshold` as
/// `(values[i] / divisor, i)`.
///
/// Adds the number of matches to the counter and returns its new value.
pub fn select_layer<T: Gradient>(
    launch: LaunchConfig,
    values: &[T],
    threshold: T,
    divisor: T,
    out: &SelectOutput<'_, T>,
) -> usize {
    let capacity = out.values.len().min(out.indices.len());
    for_each_block(launch, values.len(), |tile| {
        let hits = tile
            .clone()
            .filter(|&i| passes(values[i], threshold))
            .count();
        if hits == 0 {
            return;
        }
        let mut slot = out.counter.fetch_add(hits as u32, Ordering::Relaxed) as usize;
        for i in tile {
            if !passes(values[i], threshold) {
                continue;
            }
            if slot < capacity {
                // SAFETY: `slot` lies in the range this block claimed.
                unsafe {
                    out.values.write(slot, values[i] / divisor);
                    out.indices.write(slot, i as u32);
                }
            }
            slot += 1;
        }
    });
    out.counter.load(Ordering::Acquire) as usize
}

/// Outcome of selecting one layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection<T> {
    /// Threshold the final scan used.
    pub threshold: T,
    /// True number of elements that passed it.
    pub matched: usize,
}

/// Select with `threshold`, lowering it until at least `required` elements
/// pass, then raising it so the largest ones fit the output.
///
/// Each retry doubles the rank of the sample used as threshold in
/// `sorted_samples` (descending). Once the samples are exhausted the
/// threshold drops to 0, which every non-NaN element passes, so the loop
/// always ends with `min(required, N)` matches or more.
///
/// When more than `max(target, required)` elements pass, the threshold is
/// raised to the magnitude of the `max(target, required)`-th largest
/// candidate and the layer is scanned again. Only ties at that magnitude
/// can then overflow the output.
#[allow(clippy::too_many_arguments)]
pub fn select_at_least<T: Gradient>(
    launch: LaunchConfig,
    values: &[T],
    sorted_samples: &[T],
    target: usize,
    required: usize,
    threshold: T,
    divisor: T,
    out: &SelectOutput<'_, T>,
) -> Selection<T> {
    let required = required.min(values.len());
    let samples = sorted_samples.len();
    let mut rank = threshold_rank(samples, target, values.len());
    let mut threshold = threshold;

    loop {
        out.counter.store(0, Ordering::Release);
        let matched = select_layer(launch, values, threshold, divisor, out);
        if matched >= required || threshold <= T::ZERO {
            return tighten(launch, values, target.max(required), threshold, matched, divisor, out);
        }

        let next = (rank * 2).max(1).min(samples);
        threshold = if next > rank && next > 0 {
            let t = sorted_samples[next - 1];
            if t.is_finite() { t } else { T::ZERO }
        } else {
            T::ZERO
        };
        tracing::trace!(
            matched,
            required,
            rank = next,
            threshold = threshold.to_f64(),
            "lowering threshold"
        );
        rank = next;
    }
}

/// Raise `threshold` to the `keep`-th largest magnitude among the elements
/// that passed it, rescanning when that changes the selection.
fn tighten<T: Gradient>(
    launch: LaunchConfig,
    values: &[T],
    keep: usize,
    threshold: T,
    matched: usize,
    divisor: T,
    out: &SelectOutput<'_, T>,
) -> Selection<T> {
    if keep == 0 || matched <= keep {
        return Selection { threshold, matched };
    }
    let mut candidates: Vec<T> = values
        .par_iter()
        .map(|&x| x.abs())
        .filter(|&m| m >= threshold)
        .collect();
    if candidates.len() <= keep {
        return Selection { threshold, matched };
    }
    let (_, &mut kth, _) = candidates
        .select_nth_unstable_by(keep - 1, |a, b| b.partial_cmp(a).unwrap_or(CmpOrdering::Equal));
    if kth.partial_cmp(&threshold) != Some(CmpOrdering::Greater) {
        return Selection { threshold, matched };
    }

    out.counter.store(0, Ordering::Release);
    let tightened = select_layer(launch, values, kth, divisor, out);
    tracing::trace!(
        matched,
        tightened,
        keep,
        threshold = kth.to_f64(),
        "raising threshold"
    );
    Selection {
        threshold: kth,
        matched: tightened,
    }
}
