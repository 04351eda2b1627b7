//! Threshold estimation from sorted samples.
//!
//! With `M` samples from a layer of `N` elements and a budget of `target`
//! elements, the `k`-th largest sample with `k = ceil(M * target / N)`
//! estimates the magnitude above which roughly `target` elements lie.

use std::cmp::Ordering;

use rayon::prelude::*;

use crate::device::{LaunchConfig, for_each_lane};
use crate::element::Gradient;
use crate::memory::LaneSlice;

/// Rank of the sample used as threshold, in `[1, samples]`.
///
/// Returns 0 when there are no samples.
pub fn threshold_rank(samples: usize, target: usize, num_elements: usize) -> usize {
    if samples == 0 || num_elements == 0 {
        return 0;
    }
    let k = (samples as u128 * target as u128).div_ceil(num_elements as u128);
    k.clamp(1, samples as u128) as usize
}

/// Sort every segment `[starts[l], starts[l + 1])` in descending order.
pub fn sort_segments_desc<T: Gradient>(samples: &mut [T], starts: &[u64]) {
    let mut segments = Vec::with_capacity(starts.len().saturating_sub(1));
    let mut rest = samples;
    let mut consumed = 0u64;
    for w in starts.windows(2) {
        let skip = (w[0] - consumed) as usize;
        let len = (w[1] - w[0]) as usize;
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(skip);
        let (segment, tail) = tail.split_at_mut(len);
        segments.push(segment);
        rest = tail;
        consumed = w[1];
    }
    segments
        .into_par_iter()
        .for_each(|s| s.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal)));
}

/// One lane per layer: write each layer's threshold from its sorted samples.
///
/// A layer whose `target` covers it entirely, or that has no samples, gets
/// threshold 0 so every element passes. Non-finite estimates also fall back
/// to 0.
pub fn lookup_thresholds<T: Gradient>(
    launch: LaunchConfig,
    sorted: &[T],
    layer_starts: &[u64],
    sample_starts: &[u64],
    targets: &[usize],
    thresholds: &mut [T],
) {
    let layers = targets.len();
    let out = LaneSlice::new(&mut thresholds[..layers]);
    for_each_lane(launch, layers, |l| {
        let n = (layer_starts[l + 1] - layer_starts[l]) as usize;
        let m = (sample_starts[l + 1] - sample_starts[l]) as usize;
        let k = threshold_rank(m, targets[l], n);
        let threshold = if targets[l] >= n || k == 0 {
            T::ZERO
        } else {
            let t = sorted[sample_starts[l] as usize + k - 1];
            if t.is_finite() { t } else { T::ZERO }
        };
        // SAFETY: lane `l` owns threshold slot `l`.
        unsafe { out.write(l, threshold) };
    });
}
