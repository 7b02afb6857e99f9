//! The BCM2836 local timer, whose interrupt is deliberately bounced from
//! core to core: each core that services it rewrites the routing register to
//! aim the next expiry at its neighbor.

use crate::architecture::machine;
use crate::board::Mmio;
use crate::call_once;
use core::sync::atomic::{AtomicU8, Ordering};
use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields, register_structs,
    registers::{ReadWrite, WriteOnly},
};

register_bitfields! {u32,
    CONTROL [
        /// The interrupt is currently asserted
        INTERRUPT_FLAG OFFSET(31) NUMBITS(1),
        /// Raise interrupts on expiry
        INTERRUPT_ENABLE OFFSET(29) NUMBITS(1),
        /// Count down and reload
        TIMER_ENABLE OFFSET(28) NUMBITS(1),
        /// Reload value, in 38.4 MHz crystal ticks
        RELOAD OFFSET(0) NUMBITS(28)
    ],
    CLEAR_RELOAD [
        /// Acknowledge the pending interrupt
        INTERRUPT_CLEAR OFFSET(31) NUMBITS(1),
        /// Force an immediate reload of the counter
        RELOAD_NOW OFFSET(30) NUMBITS(1)
    ],
    ROUTING [
        /// Which core's IRQ line the local timer drives
        CORE OFFSET(0) NUMBITS(3)
    ],
    TIMER_INTERRUPT_CONTROL [
        /// Forward the non-secure physical timer interrupt to this core
        nCNTPNSIRQ OFFSET(1) NUMBITS(1)
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub RegisterBlock {
        (0x00 => _reserved),
        (0x24 => LOCAL_INTERRUPT_ROUTING: ReadWrite<u32, ROUTING::Register>),
        (0x28 => _reserved2),
        (0x34 => CONTROL_STATUS: ReadWrite<u32, CONTROL::Register>),
        (0x38 => CLEAR_RELOAD: WriteOnly<u32, CLEAR_RELOAD::Register>),
        (0x3C => _reserved3),
        (0x40 => CORE0_TIMER_INTERRUPT_CONTROL: WriteOnly<u32, TIMER_INTERRUPT_CONTROL::Register>),
        (0x44 => CORE1_TIMER_INTERRUPT_CONTROL: WriteOnly<u32, TIMER_INTERRUPT_CONTROL::Register>),
        (0x48 => CORE2_TIMER_INTERRUPT_CONTROL: WriteOnly<u32, TIMER_INTERRUPT_CONTROL::Register>),
        (0x4C => CORE3_TIMER_INTERRUPT_CONTROL: WriteOnly<u32, TIMER_INTERRUPT_CONTROL::Register>),
        (0x50 => @END),
    }
}

/// The memory mapped local-peripheral registers
// SAFETY: This is the local peripherals' fixed location on the Raspberry Pi 3
static REGISTERS: Mmio<RegisterBlock> = unsafe { Mmio::physical(0x4000_0000) };

/// Reload interval, in crystal ticks
const RELOAD_TICKS: u32 = 2_000_000;

/// The core currently designated to service the local timer
static INTERRUPTING_CORE: AtomicU8 = AtomicU8::new(0);

/// Arms the local timer; routing starts at core 0. Runs once, on the boot
/// core.
pub fn setup() {
    call_once!();

    REGISTERS.LOCAL_INTERRUPT_ROUTING.write(ROUTING::CORE.val(0));
    REGISTERS.CONTROL_STATUS.write(
        CONTROL::INTERRUPT_ENABLE::SET
            + CONTROL::TIMER_ENABLE::SET
            + CONTROL::RELOAD.val(RELOAD_TICKS),
    );
    REGISTERS
        .CLEAR_RELOAD
        .write(CLEAR_RELOAD::INTERRUPT_CLEAR::SET + CLEAR_RELOAD::RELOAD_NOW::SET);

    for control in [
        &REGISTERS.CORE0_TIMER_INTERRUPT_CONTROL,
        &REGISTERS.CORE1_TIMER_INTERRUPT_CONTROL,
        &REGISTERS.CORE2_TIMER_INTERRUPT_CONTROL,
        &REGISTERS.CORE3_TIMER_INTERRUPT_CONTROL,
    ] {
        control.write(TIMER_INTERRUPT_CONTROL::nCNTPNSIRQ::SET);
    }
}

/// Services a pending local-timer interrupt if this core is the designated
/// one: acknowledges it and rotates the routing to the next core. Returns
/// whether anything was handled.
pub fn check_interrupt() -> bool {
    let current_core = machine::core_id();
    if !REGISTERS
        .CONTROL_STATUS
        .matches_all(CONTROL::INTERRUPT_FLAG::SET)
        || INTERRUPTING_CORE.load(Ordering::Acquire) != current_core
    {
        return false;
    }

    let next = (current_core + 1) % machine::NUM_CORES as u8;
    INTERRUPTING_CORE.store(next, Ordering::Release);
    REGISTERS
        .LOCAL_INTERRUPT_ROUTING
        .write(ROUTING::CORE.val(next.into()));
    REGISTERS
        .CLEAR_RELOAD
        .write(CLEAR_RELOAD::INTERRUPT_CLEAR::SET + CLEAR_RELOAD::RELOAD_NOW::SET);
    true
}
