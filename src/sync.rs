//! Synchronization primitives shared across cores.

mod queue;
mod spinlock;

pub use queue::WorkQueue;
pub use spinlock::{MutexGuard, SpinLock};
