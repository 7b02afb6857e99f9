//! The initialization sequence, from the assembly handoff to four running
//! event loops.

use crate::architecture::{boot, exception, machine};
use crate::kernel::event;
use crate::{board, call_once, log, memory};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

extern "Rust" {
    /// The entry point supplied by the kernel binary (or a test harness)
    fn kernel_main();
}

/// Whether the global (core 0) initialization pass has finished
static MAIN_INIT_DONE: AtomicBool = AtomicBool::new(false);

/// Global initialization of the system; every core lands here from the boot
/// assembly with its index in `core`.
#[no_mangle]
extern "C" fn start_kernel(core: u64) -> ! {
    if core == 0 {
        // This is the global initialization sequence; it runs exactly once,
        // alone, before any other core is awake
        call_once!();

        // SAFETY: Nothing else is running yet
        unsafe {
            memory::init().expect("Bringing memory online should not fail");
            super::heap::init();
        }
        board::init();

        log!("Memory and board online, waking the other cores");

        MAIN_INIT_DONE.store(true, Ordering::Release);
        // SAFETY: All shared state the secondaries read is now published
        unsafe {
            boot::wake_secondary_cores();
        }
    } else {
        while !MAIN_INIT_DONE.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        // SAFETY: Runs once on each secondary, after `memory::init`
        unsafe {
            memory::per_core_init();
        }
    }

    // SAFETY: Each core passes through here exactly once
    unsafe { per_core_init() }
}

/// Per-core initialization
///
/// # Safety
///
/// Must only be called once per core, at the end of `start_kernel`
unsafe fn per_core_init() -> ! {
    /// Number of cores that finished initialization
    static FINISHED_CORES: AtomicUsize = AtomicUsize::new(0);

    assert_eq!(
        exception::exception_level(),
        exception::PrivilegeLevel::Kernel,
        "The kernel must be running with kernel privileges"
    );

    exception::per_core_init();
    // SAFETY: This is the one-time enablement for this core
    unsafe {
        exception::enable();
    }

    // Core 0 posts the first work before anyone can be released from the
    // barrier; the rotating local timer is armed once all loops are live
    if machine::core_id() == 0 {
        event::schedule_event(|| {
            board::local_timer::setup();
            // SAFETY: `kernel_main` is appropriately defined by the build
            unsafe { kernel_main() }
        });
    }

    // The boot barrier: spin until all cores have made it this far
    FINISHED_CORES.fetch_add(1, Ordering::AcqRel);
    while FINISHED_CORES.load(Ordering::Acquire) < machine::NUM_CORES {
        core::hint::spin_loop();
    }

    log!("Core {} entering its event loop", machine::core_id());
    event::run_loop()
}
