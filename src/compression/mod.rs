//! Kernels of the compression pipeline.
//!
//! Each kernel works on plain slices and a [`LaunchConfig`](crate::device::LaunchConfig);
//! the engine runs them inside stream jobs over the state arenas.

pub mod clip;
pub mod merge;
pub mod momentum;
pub mod padding;
pub mod sampler;
pub mod selector;
pub mod threshold;
pub mod union;

pub use clip::{clip_by_norm, l2_norm};
pub use merge::{fill, mark_selected, mask_words, scatter, scatter_add};
pub use momentum::{accumulate, mask_and_carry, mask_bit};
pub use padding::pad_layer;
pub use sampler::{sample_magnitudes, seed_lane_rngs};
pub use selector::{SelectOutput, Selection, select_at_least, select_layer};
pub use threshold::{lookup_thresholds, sort_segments_desc, threshold_rank};
pub use union::{gather_masked, mask_offsets, scatter_masked};
