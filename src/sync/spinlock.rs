use aarch64_cpu::asm::{sev, wfe};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-set spinlock mutex
///
/// All critical sections in the kernel are short and bounded, so plain
/// spinning (with `wfe` between attempts) is sufficient. Recursive
/// acquisition deadlocks.
pub struct SpinLock<T: ?Sized> {
    /// Whether or not the spinlock is taken
    is_locked: AtomicBool,
    /// The protected data
    data: UnsafeCell<T>,
}

// SAFETY: The spinlock guarantees exclusive access to the interior
unsafe impl<T: Send> Sync for SpinLock<T> {}
// SAFETY: See above
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a spinlock around the given data
    pub const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
            is_locked: AtomicBool::new(false),
        }
    }

    /// Locks the mutex. The mutex is automatically unlocked when the returned
    /// `MutexGuard` is dropped
    pub fn lock(&self) -> MutexGuard<T> {
        while self.is_locked.swap(true, Ordering::Acquire) {
            while self.is_locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
                wfe();
            }
        }

        MutexGuard(self)
    }

    /// Unlocks the mutex
    ///
    /// # Safety
    ///
    /// This must only be called by the destructor of the `MutexGuard` that
    /// locked this mutex
    unsafe fn unlock(&self) {
        self.is_locked.store(false, Ordering::Release);
        sev();
    }
}

/// Scoped ownership of a locked `SpinLock`; releases the lock on every exit
/// path of the enclosing scope
pub struct MutexGuard<'locked, T>(&'locked SpinLock<T>);

impl<T> MutexGuard<'_, T> {
    /// Returns a pointer to the spinlock's data
    fn get_pointer(&self) -> NonNull<T> {
        // SAFETY: pointers to `data` are nonnull
        unsafe { NonNull::new_unchecked(self.0.data.get()) }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: Since the lock has been acquired, we have exclusive access
        // to the interior
        unsafe { self.get_pointer().as_ref() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: Since the lock has been acquired, we have exclusive access
        // to the interior
        unsafe { self.get_pointer().as_mut() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: The guard is being destroyed, so this is the correct time
        // to unlock the mutex
        unsafe {
            self.0.unlock();
        }
    }
}
