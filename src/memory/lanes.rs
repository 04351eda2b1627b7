use std::marker::PhantomData;
use std::sync::atomic::AtomicU32;

/// A mutable slice that many lanes may write concurrently.
///
/// Lanes write through raw pointers. The kernel using it must guarantee that
/// no two lanes touch the same index in one launch, either by striding
/// disjointly or by claiming slots through an atomic counter.
pub struct LaneSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _borrow: PhantomData<&'a mut [T]>,
}

// SAFETY: the slice is only shared across lanes under the disjoint-index
// contract documented on the type; `T: Send` makes moving values in sound.
unsafe impl<T: Send> Send for LaneSlice<'_, T> {}
unsafe impl<T: Send> Sync for LaneSlice<'_, T> {}

impl<'a, T: Copy> LaneSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _borrow: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value` at `index`.
    ///
    /// # Safety
    /// `index < len`, and no other lane reads or writes `index` during the
    /// same launch.
    #[inline]
    pub unsafe fn write(&self, index: usize, value: T) {
        debug_assert!(index < self.len, "lane write {index} out of {}", self.len);
        unsafe { self.ptr.add(index).write(value) }
    }

    /// Load the value at `index`.
    ///
    /// # Safety
    /// `index < len`, and no other lane writes `index` during the same launch.
    #[inline]
    pub unsafe fn read(&self, index: usize) -> T {
        debug_assert!(index < self.len, "lane read {index} out of {}", self.len);
        unsafe { self.ptr.add(index).read() }
    }

    /// Narrow to `[start, start + len)`.
    pub fn sub(&mut self, start: usize, len: usize) -> LaneSlice<'_, T> {
        assert!(start + len <= self.len, "sub-slice out of bounds");
        LaneSlice {
            // SAFETY: bounds checked above.
            ptr: unsafe { self.ptr.add(start) },
            len,
            _borrow: PhantomData,
        }
    }
}

/// Reinterpret counter words as atomics so lanes can bump them.
pub fn as_atomic_u32(words: &mut [u32]) -> &[AtomicU32] {
    // SAFETY: `AtomicU32` has the same size, alignment and bit validity as
    // `u32`, and the exclusive borrow guarantees no non-atomic access
    // overlaps the returned view.
    unsafe { &*(words as *mut [u32] as *const [AtomicU32]) }
}
