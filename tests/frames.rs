#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(format_args_nl)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(libkernel::test_runner)]

extern crate alloc;

use alloc::vec::Vec;
use libkernel::add_test;
use libkernel::memory::{frames, Frame, FRAME_SIZE};

#[no_mangle]
fn kernel_main() {
    test_main();
}

add_test!(frames_recycle_in_reverse_order, {
    let allocator = frames::allocator();
    // Reserve up front so the holder itself does not disturb the pool
    let mut held: Vec<Frame> = Vec::with_capacity(100);

    let before = allocator.allocated_frames();
    for _ in 0..100 {
        held.push(allocator.allocate().expect("The pool should not be exhausted"));
    }
    let first = held[0].physical_base();
    assert_eq!(allocator.allocated_frames(), before + 100);

    // All distinct
    for (i, frame) in held.iter().enumerate() {
        for other in &held[i + 1..] {
            assert_ne!(frame.physical_base(), other.physical_base());
        }
    }

    while let Some(frame) = held.pop() {
        allocator.free(frame);
    }
    assert_eq!(allocator.allocated_frames(), before);

    // First-fit means the next allocation lands exactly where the first did
    let again = allocator.allocate().expect("The pool should not be exhausted");
    assert_eq!(again.physical_base(), first);
    allocator.free(again);
});

add_test!(frames_are_zeroed_on_allocation, {
    let allocator = frames::allocator();

    let frame = allocator.allocate().expect("The pool should not be exhausted");
    let base = frame.physical_base();
    // Dirty the frame, give it back, take it again
    // SAFETY: The frame is exclusively owned until freed
    unsafe {
        frame.as_ptr().write_bytes(0xA5, FRAME_SIZE);
    }
    allocator.free(frame);

    let again = allocator.allocate().expect("The pool should not be exhausted");
    assert_eq!(again.physical_base(), base);
    for offset in 0..FRAME_SIZE {
        // SAFETY: As above
        assert_eq!(unsafe { again.as_ptr().add(offset).read() }, 0);
    }
    allocator.free(again);
});

add_test!(contiguous_runs_are_contiguous, {
    let allocator = frames::allocator();

    let run = allocator
        .allocate_contiguous(8)
        .expect("The pool should not be exhausted");
    let base = run.physical_base();
    assert_eq!(base % FRAME_SIZE as u64, 0);

    // A single allocation must not land inside the reserved run
    let single = allocator.allocate().expect("The pool should not be exhausted");
    let distance = single.physical_base().abs_diff(base);
    assert!(distance >= 8 * FRAME_SIZE as u64 || single.physical_base() < base);

    allocator.free(single);
    allocator.free_contiguous(run, 8);
});
