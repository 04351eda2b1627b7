//! Grow-only device arenas.
//!
//! An arena is a raw allocation that only ever grows. `ensure_capacity`
//! reallocates and copies when a larger request arrives and is a no-op
//! otherwise, so the allocated size is always explicit.

use std::mem::size_of;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::Device;
use crate::element::Element;
use crate::error::{DgcError, Result};

use super::lanes::LaneSlice;

/// Backing word. Every [`Element`] type has alignment <= `u64`.
type Word = u64;
const WORD_BYTES: usize = size_of::<Word>();

/// A growable allocation on a [`Device`].
///
/// Shared between the host (which sizes it) and the stream (which runs
/// kernels over it) through an `Arc`.
pub struct DeviceArena {
    label: &'static str,
    device: Arc<Device>,
    storage: Mutex<Storage>,
}

struct Storage {
    words: Vec<Word>,
    allocated_bytes: usize,
}

impl DeviceArena {
    pub(crate) fn new(device: Arc<Device>, label: &'static str, bytes: usize) -> Result<Self> {
        device.reserve(bytes)?;
        Ok(Self {
            label,
            device,
            storage: Mutex::new(Storage {
                words: vec![0; bytes.div_ceil(WORD_BYTES)],
                allocated_bytes: bytes,
            }),
        })
    }

    /// Name used in logs and errors.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> Result<usize> {
        Ok(self.lock()?.len_bytes())
    }

    /// Grow to at least `bytes`, preserving the existing contents.
    ///
    /// Returns `true` when a reallocation happened. Newly added bytes are
    /// zeroed. Fails with [`DgcError::OutOfMemory`] without touching the
    /// current allocation when the device cannot satisfy the request.
    pub fn ensure_capacity(&self, bytes: usize) -> Result<bool> {
        let mut storage = self
            .storage
            .lock()
            .map_err(|_| DgcError::LockPoisoned(self.label))?;
        if bytes <= storage.allocated_bytes {
            return Ok(false);
        }

        let extra = bytes - storage.allocated_bytes;
        self.device.reserve(extra)?;

        let mut grown = vec![0; bytes.div_ceil(WORD_BYTES)];
        grown[..storage.words.len()].copy_from_slice(&storage.words);
        tracing::trace!(
            arena = self.label,
            from = storage.allocated_bytes,
            to = bytes,
            "arena grown"
        );
        storage.words = grown;
        storage.allocated_bytes = bytes;
        Ok(true)
    }

    /// Lock the arena for a kernel or a synchronous copy.
    pub fn lock(&self) -> Result<ArenaGuard<'_>> {
        self.storage
            .lock()
            .map(|inner| ArenaGuard { inner })
            .map_err(|_| DgcError::LockPoisoned(self.label))
    }

    /// Synchronous host-to-device copy of `data` at element offset `offset`.
    pub fn write<T: Element>(&self, offset: usize, data: &[T]) -> Result<()> {
        let end = offset + data.len();
        self.ensure_capacity(end * size_of::<T>())?;
        let mut guard = self.lock()?;
        guard.as_mut_slice::<T>()[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Synchronous device-to-host copy of `len` elements from `offset`.
    pub fn read<T: Element>(&self, offset: usize, len: usize) -> Result<Vec<T>> {
        let guard = self.lock()?;
        let slice = guard.as_slice::<T>();
        let end = offset + len;
        if end > slice.len() {
            return Err(DgcError::BufferSizeMismatch {
                expected: end * size_of::<T>(),
                actual: slice.len() * size_of::<T>(),
            });
        }
        Ok(slice[offset..end].to_vec())
    }

    /// Read the whole allocation as `T`.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.lock()?.as_slice::<T>().to_vec())
    }
}

impl Drop for DeviceArena {
    fn drop(&mut self) {
        let bytes = match self.storage.get_mut() {
            Ok(storage) => storage.allocated_bytes,
            Err(poisoned) => poisoned.into_inner().allocated_bytes,
        };
        self.device.release(bytes);
    }
}

impl std::fmt::Debug for DeviceArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceArena")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to an arena's bytes, with typed views.
pub struct ArenaGuard<'a> {
    inner: MutexGuard<'a, Storage>,
}

impl ArenaGuard<'_> {
    /// Bytes visible through this guard.
    pub fn len_bytes(&self) -> usize {
        self.inner.allocated_bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        let len = self.inner.allocated_bytes;
        // SAFETY: `words` holds at least `allocated_bytes` initialized bytes
        // and `u8` has no alignment requirement.
        unsafe { std::slice::from_raw_parts(self.inner.words.as_ptr().cast::<u8>(), len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.inner.allocated_bytes;
        // SAFETY: as in `as_bytes`; the guard gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.inner.words.as_mut_ptr().cast::<u8>(), len) }
    }

    /// View the allocation as whole `T` elements.
    pub fn as_slice<T: Element>(&self) -> &[T] {
        let len = self.inner.allocated_bytes / size_of::<T>();
        // SAFETY: `Element` types are plain old data with alignment <= 8, the
        // backing `Vec<u64>` is 8-aligned and holds `len * size_of::<T>()`
        // initialized bytes. Any bit pattern is a valid `T`.
        unsafe { std::slice::from_raw_parts(self.inner.words.as_ptr().cast::<T>(), len) }
    }

    /// Mutable typed view, see [`ArenaGuard::as_slice`].
    pub fn as_mut_slice<T: Element>(&mut self) -> &mut [T] {
        let len = self.inner.allocated_bytes / size_of::<T>();
        // SAFETY: see `as_slice`; the guard gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.inner.words.as_mut_ptr().cast::<T>(), len) }
    }

    /// Lane-shareable view for kernels that scatter into the arena.
    pub fn lanes<T: Element>(&mut self) -> LaneSlice<'_, T> {
        LaneSlice::new(self.as_mut_slice::<T>())
    }
}
