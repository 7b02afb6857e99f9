use core::cell::UnsafeCell;
use core::ops::Deref;

/// A cell that is written exactly once, during initialization, and read-only
/// afterwards.
///
/// Unlike a lock, reads after initialization are free: the single write is
/// sequenced before any reader by the boot sequence.
pub struct InitCell<T> {
    /// The protected value
    inner: UnsafeCell<Option<T>>,
}

impl<T> InitCell<T> {
    /// Creates an empty, not-yet-initialized cell
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(None),
        }
    }

    /// Stores the value into the cell
    ///
    /// # Safety
    ///
    /// Must only be called once, during single-threaded initialization,
    /// before any reader can observe the cell
    pub unsafe fn set(&self, value: T) {
        // SAFETY: By assumption, no concurrent access is possible
        let slot = unsafe { &mut *self.inner.get() };
        assert!(slot.replace(value).is_none(), "InitCell was already set");
    }

    /// Returns the stored value, if the cell has been initialized
    pub fn get(&self) -> Option<&T> {
        // SAFETY: After initialization the cell is never written again, so
        // shared references are always valid
        unsafe { &*self.inner.get() }.as_ref()
    }
}

impl<T> Deref for InitCell<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get().expect("InitCell should be set before first use")
    }
}

// SAFETY: The single-write-before-read contract makes shared access safe
unsafe impl<T: Send + Sync> Sync for InitCell<T> {}
// SAFETY: See above
unsafe impl<T: Send> Send for InitCell<T> {}
