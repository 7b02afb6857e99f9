//! The boot path: assembly bring-up plus the secondary-core wake-up protocol.

use super::machine;
use aarch64_cpu::asm::sev;

// The boot sequence
core::arch::global_asm!(include_str!("boot.s"));

extern "C" {
    /// Entry point the wake-up mailbox sends secondary cores through
    fn _start_secondary();
}

/// Physical address of the firmware's core wake-up mailbox: one 64-bit slot
/// per core, written with that core's entry point
const CORE_WAKEUP_MAILBOX: u64 = 216;

/// Starts cores 1 through 3.
///
/// Each secondary runs the shared assembly prologue and lands in
/// `start_kernel` with its core index; the caller's boot barrier is what
/// keeps them from racing ahead.
///
/// # Safety
///
/// Must only be called once, by core 0, after the data the secondaries will
/// read (boot tables included) is fully published
pub unsafe fn wake_secondary_cores() {
    crate::call_once!();
    // The boot code is linked at its physical address, so the symbol value
    // is already what the firmware expects
    let entry = _start_secondary as usize as u64;
    for core in 1..machine::NUM_CORES as u64 {
        let slot =
            machine::physical_to_kernel(CORE_WAKEUP_MAILBOX + 8 * core) as *mut u64;
        // SAFETY: The mailbox slots are reserved for exactly this protocol
        unsafe {
            slot.write_volatile(entry);
        }
    }
    sev();
}
