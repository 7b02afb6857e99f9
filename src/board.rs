//! Drivers for the BCM2837 peripherals the core depends on: the serial sink,
//! the tick source, the interrupt controller and the SD host.

pub mod emmc;
pub mod irq;
pub mod local_timer;
pub mod timer;
pub mod uart;

pub use uart::serial;

use crate::architecture::machine;
use crate::call_once;
use core::ops::Deref;
use core::ptr::NonNull;

/// A typed window onto one peripheral's register block.
///
/// Built from the device's documented physical address; the stored pointer
/// is the kernel's upper-half alias of it, which the boot tables map as
/// device memory. Dereferencing yields the `tock-registers` view of the
/// block. The window provides no exclusion of its own — serializing access
/// to the device behind it is each driver's job.
pub struct Mmio<T> {
    /// Kernel alias of the register block
    registers: NonNull<T>,
}

impl<T> Mmio<T> {
    /// Opens a window over the register block at the given physical address
    ///
    /// # Safety
    ///
    /// The address must be the block's documented location, and at most one
    /// window may drive any one device
    pub const unsafe fn physical(address: u64) -> Self {
        Self {
            // SAFETY: The kernel alias of a device address is never null
            registers: unsafe {
                NonNull::new_unchecked(machine::physical_to_kernel(address) as *mut T)
            },
        }
    }
}

impl<T> Deref for Mmio<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: The pointer was derived from the device's fixed, mapped
        // address and the pointee is only ever accessed volatilely
        unsafe { self.registers.as_ref() }
    }
}

// SAFETY: The window only denotes a device address; drivers are responsible
// for serializing what happens behind it
unsafe impl<T> Send for Mmio<T> {}
// SAFETY: See above
unsafe impl<T> Sync for Mmio<T> {}

/// Initializes the board-level peripherals. Runs once, on the boot core,
/// after memory is online.
pub fn init() {
    call_once!();
    uart::serial().init();
    timer::init();
}
