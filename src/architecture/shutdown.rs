/// Invokes a system shutdown, as appropriate
///
/// In QEMU, this exits QEMU with the given code
pub fn shutdown(exit_code: u32) -> ! {
    use crate::{architecture, log};
    use aarch64_cpu::asm::wfi;
    use core::sync::atomic::{AtomicBool, Ordering};
    use qemu_exit::QEMUExit;

    /// Whether or not a shutdown has already begun
    static SHUTDOWN_CALLED: AtomicBool = AtomicBool::new(false);
    if SHUTDOWN_CALLED.swap(true, Ordering::Relaxed) {
        loop {
            // Another core got here first; just enter a low power state
            wfi();
        }
    }

    log!(
        "Core {}: shutdown ({})",
        architecture::machine::core_id(),
        exit_code
    );
    qemu_exit::AArch64::new().exit(exit_code);
}
