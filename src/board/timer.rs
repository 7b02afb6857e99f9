//! The BCM2837 system timer: a 1 MHz free-running counter with compare
//! channels. Compare channel 0 is reprogrammed on every match to advance the
//! kernel's monotonic millisecond tick.

use crate::board::{irq, Mmio};
use crate::call_once;
use core::sync::atomic::{AtomicU32, Ordering};
use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields, register_structs,
    registers::{ReadOnly, ReadWrite},
};

register_bitfields! {u32,
    CS [
        /// Compare channel 0 matched; write 1 to acknowledge
        M0 OFFSET(0) NUMBITS(1)
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub RegisterBlock {
        (0x00 => CS: ReadWrite<u32, CS::Register>),
        (0x04 => CLO: ReadOnly<u32>),
        (0x08 => CHI: ReadOnly<u32>),
        (0x0C => C0: ReadWrite<u32>),
        (0x10 => C1: ReadWrite<u32>),
        (0x14 => C2: ReadWrite<u32>),
        (0x18 => C3: ReadWrite<u32>),
        (0x1C => @END),
    }
}

/// The memory mapped system-timer registers
// SAFETY: This is the system timer's fixed location on the Raspberry Pi 3
static REGISTERS: Mmio<RegisterBlock> = unsafe { Mmio::physical(0x3F00_3000) };

/// Counter increments per tick: the counter runs at 1 MHz and the kernel
/// tick is one millisecond
const TICK_INTERVAL: u32 = 1_000;

/// The monotonic millisecond counter
static TICKS: AtomicU32 = AtomicU32::new(0);

/// The current monotonic tick count, in milliseconds since timer setup
pub fn ticks_ms() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Busy-waits for at least `n` milliseconds of wall-clock time.
///
/// Reads the hardware counter directly, so it also works with interrupts
/// masked.
pub fn delay_ms(n: u32) {
    delay_us(n * 1_000);
}

/// Busy-waits for at least `n` microseconds
pub(crate) fn delay_us(n: u32) {
    let start = REGISTERS.CLO.get();
    while REGISTERS.CLO.get().wrapping_sub(start) < n {
        core::hint::spin_loop();
    }
}

/// Advances the tick, acknowledges the match and schedules the next one.
/// Called from the IRQ path with interrupts masked.
pub fn handle_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    REGISTERS
        .C0
        .set(REGISTERS.CLO.get().wrapping_add(TICK_INTERVAL));
    REGISTERS.CS.write(CS::M0::SET);
}

/// Arms compare channel 0 and unmasks its interrupt line. Runs once, on the
/// boot core, before the other cores are released.
pub(super) fn init() {
    call_once!();
    REGISTERS
        .C0
        .set(REGISTERS.CLO.get().wrapping_add(TICK_INTERVAL));
    REGISTERS.CS.write(CS::M0::SET);
    irq::enable_system_timer();
}
