//! The typed handlers behind the vector table.
//!
//! Everything arriving from the current EL is fatal by design: the kernel
//! does not fault in normal operation. Traps from EL0 are the interesting
//! ones; the synchronous handler demuxes the exception class and either
//! services a system call or panics with the syndrome registers.

use super::exception::TrapFrame;
use crate::{board, kernel};
use aarch64_cpu::registers::{ELR_EL1, ESR_EL1, FAR_EL1};
use tock_registers::interfaces::Readable;

/// What the assembly stub should do after a lower-EL synchronous handler
/// returns
#[repr(u64)]
pub enum Directive {
    /// Restore the saved frame and `eret` back to the interrupted context
    ReturnToUser = 0,
    /// Abandon the frame and drop into this core's event loop
    EnterEventLoop = 1,
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_curr_el0_sync(_frame: &mut TrapFrame) {
    panic!("Synchronous exception taken with SP_EL0");
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_curr_el0_irq(_frame: &mut TrapFrame) {
    panic!("IRQ taken with SP_EL0");
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_curr_el0_fiq(_frame: &mut TrapFrame) {
    panic!("FIQ taken with SP_EL0");
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_curr_el0_other(_frame: &mut TrapFrame) {
    panic!("Miscellaneous exception taken with SP_EL0");
}

/// A synchronous exception in kernel mode is always a structural violation
#[no_mangle]
extern "C" fn handle_curr_elx_sync(_frame: &mut TrapFrame) {
    match ESR_EL1.read_as_enum(ESR_EL1::EC) {
        Some(ESR_EL1::EC::Value::InstrAbortCurrentEL) => {
            panic!(
                "Instruction abort in kernel mode: ESR {:#X}, FAR {:#X}, ELR {:#X}",
                ESR_EL1.get(),
                FAR_EL1.get(),
                ELR_EL1.get()
            );
        }
        Some(ESR_EL1::EC::Value::DataAbortCurrentEL) => {
            panic!(
                "Data abort in kernel mode: ESR {:#X}, FAR {:#X}, ELR {:#X}",
                ESR_EL1.get(),
                FAR_EL1.get(),
                ELR_EL1.get()
            );
        }
        _ => panic!(
            "Unhandled synchronous exception in kernel mode, class {:#08b} (ESR {:#X}, ELR {:#X})",
            ESR_EL1.read(ESR_EL1::EC),
            ESR_EL1.get(),
            ELR_EL1.get()
        ),
    }
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_curr_elx_irq(_frame: &mut TrapFrame) {
    handle_irq();
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_curr_elx_fiq(_frame: &mut TrapFrame) {
    panic!("FIQ taken with SP_ELX");
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_curr_elx_other(_frame: &mut TrapFrame) {
    panic!("Miscellaneous exception taken with SP_ELX");
}

/// Demuxes a synchronous exception from user mode
#[no_mangle]
extern "C" fn handle_lower_el_sync_64(frame: &mut TrapFrame) -> Directive {
    match ESR_EL1.read_as_enum(ESR_EL1::EC) {
        Some(ESR_EL1::EC::Value::SVC64) => {
            let immediate = (ESR_EL1.read(ESR_EL1::ISS) & 0xFFFF) as u16;
            kernel::syscall::handle(immediate, frame)
        }
        Some(ESR_EL1::EC::Value::InstrAbortLowerEL) => {
            panic!(
                "Instruction abort from user mode: ESR {:#X}, FAR {:#X}, ELR {:#X}",
                ESR_EL1.get(),
                FAR_EL1.get(),
                ELR_EL1.get()
            );
        }
        Some(ESR_EL1::EC::Value::DataAbortLowerEL) => {
            panic!(
                "Data abort from user mode: ESR {:#X}, FAR {:#X}, ELR {:#X}",
                ESR_EL1.get(),
                FAR_EL1.get(),
                ELR_EL1.get()
            );
        }
        _ => panic!(
            "Unhandled synchronous exception from user mode, class {:#08b} (ESR {:#X})",
            ESR_EL1.read(ESR_EL1::EC),
            ESR_EL1.get()
        ),
    }
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_lower_el_irq_64(_frame: &mut TrapFrame) {
    handle_irq();
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_lower_el_fiq_64(_frame: &mut TrapFrame) {
    panic!("FIQ taken from lower EL, in 64-bit");
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_lower_el_other_64(_frame: &mut TrapFrame) {
    panic!("Miscellaneous exception taken from lower EL, in 64-bit");
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_lower_el_sync_32(_frame: &mut TrapFrame) {
    panic!("Synchronous exception taken from lower EL, in 32-bit");
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_lower_el_irq_32(_frame: &mut TrapFrame) {
    panic!("IRQ taken from lower EL, in 32-bit");
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_lower_el_fiq_32(_frame: &mut TrapFrame) {
    panic!("FIQ taken from lower EL, in 32-bit");
}

#[allow(clippy::missing_docs_in_private_items)]
#[no_mangle]
extern "C" fn handle_lower_el_other_32(_frame: &mut TrapFrame) {
    panic!("Miscellaneous exception taken from lower EL, in 32-bit");
}

/// Routes a pending IRQ to its handler: the rotating local timer first, then
/// the system timer's tick line.
fn handle_irq() {
    board::local_timer::check_interrupt();

    if board::irq::system_timer_pending() {
        board::timer::handle_tick();
    }
}
