//! The BCM2837 legacy interrupt controller.
//!
//! Only the system timer's match line is ever enabled; the local timer is
//! routed separately through the per-core registers in `local_timer`.

use crate::board::Mmio;
use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields, register_structs,
    registers::{ReadOnly, WriteOnly},
};

register_bitfields! {u32,
    PENDING_1 [
        /// System timer compare channel 0 matched
        SYSTEM_TIMER_MATCH_0 OFFSET(0) NUMBITS(1)
    ],
    ENABLE_1 [
        SYSTEM_TIMER_MATCH_0 OFFSET(0) NUMBITS(1)
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub RegisterBlock {
        (0x000 => _reserved),
        (0x200 => IRQ_BASIC_PENDING: ReadOnly<u32>),
        (0x204 => IRQ_PENDING_1: ReadOnly<u32, PENDING_1::Register>),
        (0x208 => IRQ_PENDING_2: ReadOnly<u32>),
        (0x20C => FIQ_CONTROL: WriteOnly<u32>),
        (0x210 => ENABLE_IRQS_1: WriteOnly<u32, ENABLE_1::Register>),
        (0x214 => ENABLE_IRQS_2: WriteOnly<u32>),
        (0x218 => ENABLE_BASIC_IRQS: WriteOnly<u32>),
        (0x21C => DISABLE_IRQS_1: WriteOnly<u32>),
        (0x220 => DISABLE_IRQS_2: WriteOnly<u32>),
        (0x224 => DISABLE_BASIC_IRQS: WriteOnly<u32>),
        (0x228 => @END),
    }
}

/// The memory mapped interrupt-controller registers
// SAFETY: This is the controller's fixed location on the Raspberry Pi 3
static REGISTERS: Mmio<RegisterBlock> = unsafe { Mmio::physical(0x3F00_B000) };

/// Whether the system timer's match line is pending
pub fn system_timer_pending() -> bool {
    REGISTERS
        .IRQ_PENDING_1
        .matches_all(PENDING_1::SYSTEM_TIMER_MATCH_0::SET)
}

/// Unmasks the system timer's match line
pub(super) fn enable_system_timer() {
    REGISTERS
        .ENABLE_IRQS_1
        .write(ENABLE_1::SYSTEM_TIMER_MATCH_0::SET);
}
