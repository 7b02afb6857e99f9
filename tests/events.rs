#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(format_args_nl)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(libkernel::test_runner)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use libkernel::add_test;
use libkernel::kernel::event;
use libkernel::sync::WorkQueue;

#[no_mangle]
fn kernel_main() {
    test_main();
}

add_test!(scheduled_events_all_run_once, {
    const EVENTS: u64 = 10;
    let counter = Arc::new(AtomicU64::new(0));

    for _ in 0..EVENTS {
        let counter = Arc::clone(&counter);
        event::schedule_event(move || {
            counter.fetch_add(1, Ordering::AcqRel);
        });
    }

    // The other cores drain the queue while this one watches
    while counter.load(Ordering::Acquire) < EVENTS {
        core::hint::spin_loop();
    }
    assert_eq!(counter.load(Ordering::Acquire), EVENTS);
});

add_test!(reenqueueing_work_resumes, {
    let progress = Arc::new(AtomicU64::new(0));

    /// A work item that yields once by re-enqueueing a continuation
    fn staged(progress: Arc<AtomicU64>) {
        if progress.fetch_add(1, Ordering::AcqRel) == 0 {
            event::schedule_event(move || staged(progress));
        }
    }
    let handle = Arc::clone(&progress);
    event::schedule_event(move || staged(handle));

    while progress.load(Ordering::Acquire) < 2 {
        core::hint::spin_loop();
    }
    assert_eq!(progress.load(Ordering::Acquire), 2);
});

add_test!(work_queue_hands_back_everything, {
    let queue = WorkQueue::new();
    assert!(queue.is_empty());

    let sum = Arc::new(AtomicU64::new(0));
    for value in 1..=5_u64 {
        let sum = Arc::clone(&sum);
        queue.enqueue(Box::new(move || {
            sum.fetch_add(value, Ordering::AcqRel);
        }));
    }
    assert!(!queue.is_empty());

    let mut drained = 0;
    while let Some(work) = queue.dequeue() {
        work();
        drained += 1;
    }
    assert_eq!(drained, 5);
    assert!(queue.is_empty());
    assert_eq!(sum.load(Ordering::Acquire), 15);
});
