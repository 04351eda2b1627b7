use crate::device::{LaunchConfig, for_each_lane};
use crate::element::Element;
use crate::memory::LaneSlice;

/// Fill slots `[filled, values.len())` of a compacted layer with the value
/// and index sentinels.
///
/// Idempotent: padding a padded buffer again changes nothing.
pub fn pad_layer<T: Element>(launch: LaunchConfig, values: &mut [T], indices: &mut [u32], filled: usize) {
    let len = values.len().min(indices.len());
    if filled >= len {
        return;
    }
    let values = LaneSlice::new(&mut values[filled..len]);
    let indices = LaneSlice::new(&mut indices[filled..len]);
    for_each_lane(launch, len - filled, |i| {
        // SAFETY: lane `i` owns slot `i`.
        unsafe {
            values.write(i, T::INVALID);
            indices.write(i, u32::INVALID);
        }
    });
}
