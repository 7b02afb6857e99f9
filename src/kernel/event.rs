//! The cooperative scheduler: one shared work queue feeding an event loop on
//! every core.
//!
//! Work items run to completion; a long-running item simply occupies its
//! core. Cooperative code yields by re-enqueueing a continuation of itself
//! and returning. Items are single-shot and destroyed after running.

use crate::sync::WorkQueue;
use alloc::boxed::Box;

/// The global work queue all cores pull from
static READY_QUEUE: WorkQueue = WorkQueue::new();

/// Enqueues a work item for some core to run.
///
/// The closure must own everything it touches; it may run on any core, any
/// time after this call.
pub fn schedule_event(work: impl FnOnce() + Send + 'static) {
    READY_QUEUE.enqueue(Box::new(work));
}

/// Whether any work is currently visible in the queue. An observation only.
pub fn work_pending() -> bool {
    !READY_QUEUE.is_empty()
}

/// Pulls and runs work items forever.
///
/// Every core parks itself here once booted; the trap path also falls back
/// into this loop whenever a process exits or yields.
pub fn run_loop() -> ! {
    loop {
        if let Some(work) = READY_QUEUE.dequeue() {
            work();
        }
        core::hint::spin_loop();
    }
}

/// The assembly-facing alias for the trap path's drop into the loop
#[no_mangle]
extern "C" fn event_loop_entry() -> ! {
    run_loop()
}
