//! Momentum correction.
//!
//! Velocity and accumulated velocity are computed for every element before
//! selection. Once the selection bitmask is known, the carried state is
//! cleared where an element was sent and kept everywhere else, so small
//! gradients are delayed rather than dropped.

use crate::device::{LaunchConfig, for_each_lane};
use crate::element::Gradient;
use crate::memory::LaneSlice;

/// `velocity = momentum * prev_velocity + grad`,
/// `accumulated = prev_accumulated + velocity`.
pub fn accumulate<T: Gradient>(
    launch: LaunchConfig,
    momentum: T,
    grad: &[T],
    prev_velocity: &[T],
    prev_accumulated: &[T],
    velocity: &mut [T],
    accumulated: &mut [T],
) {
    let n = grad.len();
    debug_assert!(prev_velocity.len() >= n && prev_accumulated.len() >= n);
    let velocity = LaneSlice::new(&mut velocity[..n]);
    let accumulated = LaneSlice::new(&mut accumulated[..n]);
    for_each_lane(launch, n, |i| {
        let v = momentum * prev_velocity[i] + grad[i];
        // SAFETY: lane `i` owns index `i`.
        unsafe {
            velocity.write(i, v);
            accumulated.write(i, prev_accumulated[i] + v);
        }
    });
}

/// True if bit `i` is set in a packed `u32` bitmask.
#[inline]
pub fn mask_bit(mask: &[u32], i: usize) -> bool {
    (mask[i / 32] >> (i % 32)) & 1 == 1
}

/// Carry `velocity`/`accumulated` into the previous-step buffers, zeroed at
/// positions whose bit is set in `mask`.
pub fn mask_and_carry<T: Gradient>(
    launch: LaunchConfig,
    mask: &[u32],
    velocity: &[T],
    accumulated: &[T],
    prev_velocity: &mut [T],
    prev_accumulated: &mut [T],
) {
    let n = velocity.len();
    let prev_velocity = LaneSlice::new(&mut prev_velocity[..n]);
    let prev_accumulated = LaneSlice::new(&mut prev_accumulated[..n]);
    for_each_lane(launch, n, |i| {
        let (v, a) = if mask_bit(mask, i) {
            (T::ZERO, T::ZERO)
        } else {
            (velocity[i], accumulated[i])
        };
        // SAFETY: lane `i` owns index `i`.
        unsafe {
            prev_velocity.write(i, v);
            prev_accumulated.write(i, a);
        }
    });
}
