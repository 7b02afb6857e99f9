//! Ownership of all physical memory: the frame pool and the translation
//! tables built on top of it.

pub mod frames;
pub mod translation;

pub use frames::{Frame, FrameAllocator, OutOfMemory, FRAME_SIZE};
pub use translation::{MappingFlags, PageSize, TranslationTable};

use crate::{architecture::machine, call_once};

/// The kernel's own translation table, built once at boot and immutable
/// afterwards
static KERNEL_TABLE: crate::cell::InitCell<TranslationTable> = crate::cell::InitCell::new();

/// Size of the directly-managed physical RAM window
const RAM_SIZE: u64 = 0x2000_0000;
/// Base of the BCM2837 peripheral window
const PERIPHERALS_BASE: u64 = 0x3F00_0000;
/// Size of the BCM2837 peripheral window
const PERIPHERALS_SIZE: u64 = 0x0100_0000;
/// Base of the local (per-core) peripheral window
const LOCAL_PERIPHERALS_BASE: u64 = 0x4000_0000;
/// Size of the local peripheral window
const LOCAL_PERIPHERALS_SIZE: u64 = 0x0010_0000;

/// Brings all of memory online: seeds the frame allocator from the
/// linker-declared pool, then replaces the boot-assembly translation tables
/// with the kernel's real 4 KiB-granule table.
///
/// # Safety
///
/// Must only be called once, by the boot core, before any other memory user
pub unsafe fn init() -> Result<(), OutOfMemory> {
    call_once!();

    // SAFETY: Only called here, during single-core initialization
    unsafe {
        frames::init();
    }

    let table = TranslationTable::new()?;
    let flags = MappingFlags::new();
    let device = MappingFlags::new().with_device_memory(true);

    for page in (0..RAM_SIZE).step_by(FRAME_SIZE) {
        table.map_to(machine::physical_to_kernel(page), page, flags, PageSize::Kb4)?;
    }
    for page in (PERIPHERALS_BASE..PERIPHERALS_BASE + PERIPHERALS_SIZE).step_by(FRAME_SIZE) {
        table.map_to(machine::physical_to_kernel(page), page, device, PageSize::Kb4)?;
    }
    for page in
        (LOCAL_PERIPHERALS_BASE..LOCAL_PERIPHERALS_BASE + LOCAL_PERIPHERALS_SIZE).step_by(FRAME_SIZE)
    {
        table.map_to(machine::physical_to_kernel(page), page, device, PageSize::Kb4)?;
    }

    // SAFETY: The table covers everything the kernel touches, and the frame
    // pool backing it is never reused while the kernel runs
    unsafe {
        table.activate_ttbr1();
    }
    translation::invalidate_tlb();

    // SAFETY: Still in single-core initialization
    unsafe {
        KERNEL_TABLE.set(table);
    }
    Ok(())
}

/// Installs the kernel translation table on a secondary core.
///
/// # Safety
///
/// Must only be called once per core, after `init` has completed
pub unsafe fn per_core_init() {
    crate::call_once_per_core!();
    // SAFETY: The kernel table is fully built before secondary cores start
    unsafe {
        KERNEL_TABLE.activate_ttbr1();
    }
    translation::invalidate_tlb();
}
