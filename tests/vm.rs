#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(format_args_nl)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(libkernel::test_runner)]

extern crate alloc;

use libkernel::add_test;
use libkernel::memory::{frames, MappingFlags, PageSize, TranslationTable};

#[no_mangle]
fn kernel_main() {
    test_main();
}

/// The access flag, set on every live leaf descriptor
const ACCESS_FLAG: u64 = 1 << 10;
/// `AP[1]`: the page is reachable from EL0
const EL0_ACCESSIBLE: u64 = 1 << 6;
/// `UXN`: EL0 may not execute from the page
const EXECUTE_NEVER: u64 = 1 << 54;
/// Valid-page marker bits
const PAGE_VALID: u64 = 0b11;

add_test!(leaf_descriptor_is_composed_exactly, {
    let table = TranslationTable::new().expect("Table roots should be allocatable");
    let frame = frames::allocator().allocate().expect("The pool should not be exhausted");
    let pa = frame.physical_base();
    let va = 0x0000_0000_4000_0000;

    let flags = MappingFlags::new()
        .with_unprivileged(true)
        .with_execute_never(true);
    table
        .map_to(va, pa, flags, PageSize::Kb4)
        .expect("Mapping should succeed");

    let descriptor = table
        .leaf_descriptor(va)
        .expect("The walk should reach a live leaf");
    assert_eq!(
        u64::from(descriptor),
        pa | PAGE_VALID | ACCESS_FLAG | EL0_ACCESSIBLE | EXECUTE_NEVER
    );

    // Repeating the identical map is a no-op
    table
        .map_to(va, pa, flags, PageSize::Kb4)
        .expect("Remapping should succeed");
    assert_eq!(
        u64::from(table.leaf_descriptor(va).expect("Still mapped")),
        pa | PAGE_VALID | ACCESS_FLAG | EL0_ACCESSIBLE | EXECUTE_NEVER
    );

    // Unmapping restores the prior (empty) state
    table.unmap(va, PageSize::Kb4);
    assert!(table.leaf_descriptor(va).is_none());
    assert!(table.translate(va).is_none());

    // SAFETY: The table was never installed anywhere
    unsafe {
        table.release();
    }
    frames::allocator().free(frame);
});

add_test!(translate_preserves_page_offsets, {
    let table = TranslationTable::new().expect("Table roots should be allocatable");
    let va = 0x0000_0000_1234_5000;

    let pa = table
        .map(va, MappingFlags::new(), PageSize::Kb4)
        .expect("Mapping should succeed");
    assert_eq!(table.translate(va), Some(pa));
    assert_eq!(table.translate(va + 0x123), Some(pa + 0x123));
    assert_eq!(table.translate(va + 0x1000), None);

    // SAFETY: The table was never installed anywhere, and its mapped frame
    // was freshly allocated for it
    unsafe {
        table.release();
    }
});

add_test!(unmap_of_unmapped_is_a_no_op, {
    let table = TranslationTable::new().expect("Table roots should be allocatable");
    let before = frames::allocator().allocated_frames();
    // No intermediate tables exist for this address; nothing should change
    table.unmap(0x0000_7FFF_FFFF_F000, PageSize::Kb4);
    assert_eq!(frames::allocator().allocated_frames(), before);
    // SAFETY: The table was never installed anywhere
    unsafe {
        table.release();
    }
});
