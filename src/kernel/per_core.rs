use crate::architecture::machine::{self, NUM_CORES};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// One core's slot, guarded against accidental reentrant use
struct PerCoreEntry<T> {
    /// Claimed while `with_current` runs
    in_use: AtomicBool,
    /// The slot's value
    value: UnsafeCell<T>,
}

impl<T> PerCoreEntry<T> {
    /// Creates an entry holding `initial`
    const fn new(initial: T) -> Self {
        Self {
            in_use: AtomicBool::new(false),
            value: UnsafeCell::new(initial),
        }
    }
}

/// Per-core storage: each core sees only its own value, so no cross-core
/// synchronization is needed. Reentrant access from the same core (say, from
/// an interrupt handler interrupting a `with_current`) is a bug and panics.
pub struct PerCore<T> {
    /// One entry per core
    data: [PerCoreEntry<T>; NUM_CORES],
}

impl<T> PerCore<T> {
    /// Creates per-core storage from one initial value per core
    pub const fn new_with(initial: [T; NUM_CORES]) -> Self {
        let [v0, v1, v2, v3] = initial;
        Self {
            data: [
                PerCoreEntry::new(v0),
                PerCoreEntry::new(v1),
                PerCoreEntry::new(v2),
                PerCoreEntry::new(v3),
            ],
        }
    }

    /// Runs the given function with a mutable reference to the current
    /// core's value
    pub fn with_current<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let entry = &self.data[usize::from(machine::core_id())];
        // Claim the entry, so that reentrant use cannot alias the value
        assert!(
            !entry.in_use.swap(true, Ordering::Acquire),
            "A core's entry should never be accessed reentrantly"
        );
        // SAFETY: The claim above plus per-core indexing make this the only
        // live reference
        let result = f(unsafe { &mut *entry.value.get() });
        entry.in_use.store(false, Ordering::Release);
        result
    }
}

impl<T: Copy> PerCore<T> {
    /// Creates per-core storage with every core starting from the same value
    pub const fn new(initial: T) -> Self {
        Self::new_with([initial; NUM_CORES])
    }
}

// SAFETY: Each core only touches its own entry, and the claim flag rejects
// the one remaining hazard (same-core reentrancy)
unsafe impl<T> Send for PerCore<T> {}
// SAFETY: See above
unsafe impl<T> Sync for PerCore<T> {}
