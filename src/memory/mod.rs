mod arena;
mod lanes;
mod pinned;

pub use arena::{ArenaGuard, DeviceArena};
pub use lanes::{LaneSlice, as_atomic_u32};
pub use pinned::PinnedHostBuffer;
