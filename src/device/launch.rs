//! Grid-stride launches on the rayon pool.
//!
//! A launch has `grid_size` blocks of `block_size` lanes. Lane `l` visits
//! `l, l + stride, l + 2 * stride, ...` with `stride = grid_size * block_size`,
//! so the same geometry knobs that tune a GPU kernel decide how work is split.

use std::ops::Range;

use rayon::prelude::*;

/// Launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid_size: usize,
    pub block_size: usize,
}

impl LaunchConfig {
    /// Zero dimensions are raised to 1.
    pub fn new(grid_size: usize, block_size: usize) -> Self {
        Self {
            grid_size: grid_size.max(1),
            block_size: block_size.max(1),
        }
    }

    /// Total lanes, which is also the grid stride.
    pub fn num_lanes(&self) -> usize {
        self.grid_size * self.block_size
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::new(32, 512)
    }
}

/// Run `op(i)` for every `i` in `[0, n)`, grid-striding across lanes.
pub fn for_each_lane<F>(cfg: LaunchConfig, n: usize, op: F)
where
    F: Fn(usize) + Sync + Send,
{
    let stride = cfg.num_lanes();
    let lanes = stride.min(n);
    (0..lanes).into_par_iter().for_each(|lane| {
        let mut i = lane;
        while i < n {
            op(i);
            i += stride;
        }
    });
}

/// Like [`for_each_lane`], but each lane owns a mutable state slot that
/// survives across launches (for example a random generator).
///
/// `states` must hold at least one entry per lane; extra entries are unused.
pub fn for_each_lane_with_state<S, F>(cfg: LaunchConfig, n: usize, states: &mut [S], op: F)
where
    S: Send,
    F: Fn(&mut S, usize) + Sync + Send,
{
    let stride = cfg.num_lanes();
    assert!(states.len() >= stride, "one state per lane");
    states[..stride]
        .par_iter_mut()
        .take(n)
        .enumerate()
        .for_each(|(lane, state)| {
            let mut i = lane;
            while i < n {
                op(state, i);
                i += stride;
            }
        });
}

/// Run `op(tile)` for every `block_size` tile of `[0, n)`.
///
/// Block `b` handles tiles starting at `b * block_size`, stepping by the
/// grid stride. The tile is the unit a cooperative kernel aggregates over.
pub fn for_each_block<F>(cfg: LaunchConfig, n: usize, op: F)
where
    F: Fn(Range<usize>) + Sync + Send,
{
    let stride = cfg.num_lanes();
    let block = cfg.block_size;
    let blocks = cfg.grid_size.min(n.div_ceil(block));
    (0..blocks).into_par_iter().for_each(|b| {
        let mut start = b * block;
        while start < n {
            op(start..(start + block).min(n));
            start += stride;
        }
    });
}

/// Fold `map(i)` over `[0, n)` per lane, then combine the lane partials.
pub fn reduce_lanes<T, M, C>(cfg: LaunchConfig, n: usize, identity: T, map: M, combine: C) -> T
where
    T: Copy + Send + Sync,
    M: Fn(usize) -> T + Sync + Send,
    C: Fn(T, T) -> T + Sync + Send,
{
    let stride = cfg.num_lanes();
    let lanes = stride.min(n);
    (0..lanes)
        .into_par_iter()
        .map(|lane| {
            let mut acc = identity;
            let mut i = lane;
            while i < n {
                acc = combine(acc, map(i));
                i += stride;
            }
            acc
        })
        .reduce(|| identity, &combine)
}
