use std::sync::{Arc, Mutex, MutexGuard};

use crate::element::Element;
use crate::error::{DgcError, Result};

/// Page-locked host memory that asynchronous stream copies read from or
/// write into.
///
/// A copy enqueued on a stream captures a handle to the buffer and touches
/// it only when the stream reaches the copy. Until then the host must not
/// rewrite the contents; the token pool enforces this for staging arrays.
#[derive(Clone, Default)]
pub struct PinnedHostBuffer<T> {
    inner: Arc<Mutex<Vec<T>>>,
}

impl<T: Element> PinnedHostBuffer<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Lock for reading or writing.
    pub fn lock(&self) -> Result<MutexGuard<'_, Vec<T>>> {
        self.inner
            .lock()
            .map_err(|_| DgcError::LockPoisoned("pinned host buffer"))
    }

    /// Replace the contents, reusing the allocation when it is large enough.
    pub fn fill_from(&self, values: &[T]) -> Result<()> {
        let mut guard = self.lock()?;
        guard.clear();
        guard.extend_from_slice(values);
        Ok(())
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Result<Vec<T>> {
        Ok(self.lock()?.clone())
    }

    /// Elements currently held.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// True if both handles refer to the same host allocation.
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> std::fmt::Debug for PinnedHostBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedHostBuffer").finish_non_exhaustive()
    }
}
