use crate::device::{LaunchConfig, for_each_lane, reduce_lanes};
use crate::element::Gradient;
use crate::memory::LaneSlice;

/// L2 norm of `values`, accumulated in `f64`.
pub fn l2_norm<T: Gradient>(launch: LaunchConfig, values: &[T]) -> f64 {
    reduce_lanes(
        launch,
        values.len(),
        0.0f64,
        |i| {
            let v = values[i].to_f64();
            v * v
        },
        |a, b| a + b,
    )
    .sqrt()
}

/// Rescale `values` so their L2 norm is at most `threshold`.
///
/// Returns the applied scale, or `None` when the layer was already within
/// the threshold and left untouched.
pub fn clip_by_norm<T: Gradient>(launch: LaunchConfig, values: &mut [T], threshold: f64) -> Option<f64> {
    let norm = l2_norm(launch, values);
    if norm.is_nan() || norm <= threshold {
        return None;
    }
    let scale = threshold / norm;
    let factor = T::from_f64(scale);
    let n = values.len();
    let lanes = LaneSlice::new(values);
    for_each_lane(launch, n, |i| {
        // SAFETY: lane `i` owns index `i`.
        unsafe { lanes.write(i, lanes.read(i) * factor) };
    });
    Some(scale)
}
