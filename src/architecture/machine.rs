use aarch64_cpu::registers::MPIDR_EL1;
use tock_registers::interfaces::Readable;

/// The fixed XOR between kernel (upper-half) virtual addresses and physical
/// addresses
pub const KERNEL_OFFSET: u64 = 0xFFFF_0000_0000_0000;

/// Number of cores on the BCM2837
pub const NUM_CORES: usize = 4;

/// The index of the executing core
pub fn core_id() -> u8 {
    (MPIDR_EL1.get() & 0b11) as u8
}

/// Converts a kernel virtual address into the physical address it maps
pub const fn kernel_to_physical(va: u64) -> u64 {
    va ^ KERNEL_OFFSET
}

/// Converts a physical address into its kernel virtual alias
pub const fn physical_to_kernel(pa: u64) -> u64 {
    pa ^ KERNEL_OFFSET
}
