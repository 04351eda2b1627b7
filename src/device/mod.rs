//! Execution substrate: memory domain, in-order streams and lane launches.

mod launch;
mod stream;

pub use launch::{LaunchConfig, for_each_block, for_each_lane, for_each_lane_with_state, reduce_lanes};
pub use stream::{DeviceStream, Event, StreamContext};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{DgcError, Result};
use crate::memory::DeviceArena;

/// A memory domain that arenas are allocated from.
///
/// Tracks allocated bytes so growth past an optional capacity fails with
/// [`DgcError::OutOfMemory`] instead of aborting the process.
#[derive(Debug)]
pub struct Device {
    capacity: Option<usize>,
    allocated: AtomicUsize,
}

impl Device {
    /// A device without a capacity limit.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            capacity: None,
            allocated: AtomicUsize::new(0),
        })
    }

    /// A device that refuses to hold more than `bytes` at once.
    pub fn with_capacity(bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: Some(bytes),
            allocated: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Bytes held by live arenas.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Allocate a zeroed arena of `bytes`.
    pub fn alloc(self: &Arc<Self>, label: &'static str, bytes: usize) -> Result<Arc<DeviceArena>> {
        DeviceArena::new(Arc::clone(self), label, bytes).map(Arc::new)
    }

    pub(crate) fn reserve(&self, bytes: usize) -> Result<()> {
        let Some(capacity) = self.capacity else {
            self.allocated.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        };
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(bytes)
                    .filter(|&total| total <= capacity)
            })
            .map(|_| ())
            .map_err(|current| DgcError::OutOfMemory {
                requested: bytes,
                available: capacity.saturating_sub(current),
            })
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
    }
}
