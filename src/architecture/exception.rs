//! Installation and masking of the EL1 exception machinery.

use crate::call_once_per_core;
use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::{DAIF, TPIDR_EL1, VBAR_EL1};
use core::cell::UnsafeCell;
use tock_registers::interfaces::{Readable, Writeable};

// The exception vectors and register-frame plumbing
core::arch::global_asm!(include_str!("exception.s"));

/// The privilege level of some execution context
#[derive(Debug, PartialEq, Eq)]
pub enum PrivilegeLevel {
    /// EL0
    User,
    /// EL1
    Kernel,
    /// EL2; may or may not exist
    Hypervisor,
    /// Anything else
    Unknown,
}

/// The current exception level
pub fn exception_level() -> PrivilegeLevel {
    use aarch64_cpu::registers::CurrentEL;
    match CurrentEL.read_as_enum(CurrentEL::EL) {
        Some(CurrentEL::EL::Value::EL2) => PrivilegeLevel::Hypervisor,
        Some(CurrentEL::EL::Value::EL1) => PrivilegeLevel::Kernel,
        Some(CurrentEL::EL::Value::EL0) => PrivilegeLevel::User,
        _ => PrivilegeLevel::Unknown,
    }
}

/// The 32-slot general-register frame the vectors store on exception entry.
///
/// Slots 0 through 30 hold `x0`-`x30`; the last slot is alignment padding.
/// `ELR_EL1`, `SP_EL0` and `SPSR_EL1` stay in their system registers, which
/// is safe because interrupts remain masked for the whole handler.
#[repr(C, align(16))]
pub struct TrapFrame {
    /// The saved general registers
    pub registers: [u64; 32],
}

/// Size of each per-core interrupt stack
const INTERRUPT_STACK_SIZE: usize = 4096;

/// A 16-byte-aligned interrupt stack
#[repr(C, align(16))]
struct InterruptStack([u8; INTERRUPT_STACK_SIZE]);

/// The per-core interrupt stacks; the top of each is anchored in that core's
/// `TPIDR_EL1` so the vectors can reset to it when dropping into the event
/// loop
static mut INTERRUPT_STACKS: [InterruptStack; crate::architecture::machine::NUM_CORES] = [
    InterruptStack([0; INTERRUPT_STACK_SIZE]),
    InterruptStack([0; INTERRUPT_STACK_SIZE]),
    InterruptStack([0; INTERRUPT_STACK_SIZE]),
    InterruptStack([0; INTERRUPT_STACK_SIZE]),
];

/// Readies exception handling on the executing core: installs the vector
/// table and anchors the core's interrupt stack.
pub fn per_core_init() {
    extern "Rust" {
        static _exception_vector: UnsafeCell<()>;
    }
    call_once_per_core!();

    // SAFETY: The linker places the vector table at this symbol
    VBAR_EL1.set(unsafe { _exception_vector.get() } as u64);

    let core = usize::from(crate::architecture::machine::core_id());
    // SAFETY: Each core touches only its own stack entry, exactly once
    let top = unsafe {
        core::ptr::addr_of_mut!(INTERRUPT_STACKS[core])
            .cast::<u8>()
            .add(INTERRUPT_STACK_SIZE)
    };
    TPIDR_EL1.set(top as u64);

    // Force the vector update to complete before the next instruction
    barrier::isb(barrier::SY);
}

/// Turns on interrupts on the executing core
///
/// # Safety
///
/// Should only be used when the core first begins to run; at all other times
/// `restore` is the right tool
pub unsafe fn enable() {
    call_once_per_core!();
    assert!(
        DAIF.matches_all(DAIF::D::Masked + DAIF::A::Masked + DAIF::I::Masked + DAIF::F::Masked),
        "Interrupts must start out disabled to be enabled"
    );
    DAIF.write(DAIF::D::Unmasked + DAIF::A::Unmasked + DAIF::I::Unmasked + DAIF::F::Unmasked);
}

/// A snapshot of the interrupt masks, to be restored later
pub struct Masks {
    /// The saved `DAIF` value
    prior: u64,
}

/// Disables interrupts on the executing core
///
/// # Safety
///
/// Must be paired with a `restore` of the returned state
pub unsafe fn disable() -> Masks {
    let state = Masks { prior: DAIF.get() };
    DAIF.write(DAIF::D::Masked + DAIF::A::Masked + DAIF::I::Masked + DAIF::F::Masked);
    state
}

/// Restores the interrupt masks saved by the matching `disable`
///
/// # Safety
///
/// The state must come from the most recent `disable` on this core
pub unsafe fn restore(state: Masks) {
    DAIF.set(state.prior);
}
