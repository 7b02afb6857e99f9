//! A cooperative multi-core kernel for the Raspberry Pi 3B.
#![no_main]
#![no_std]
#![feature(custom_test_frameworks)]
#![feature(format_args_nl)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(test_runner)]
#![forbid(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod architecture;
pub mod board;
pub mod cell;
pub mod fs;
pub mod kernel;
pub mod macros;
pub mod memory;
pub mod process;
pub mod sync;

/// The default runner for unit tests.
pub fn test_runner(tests: &[&TestCase]) -> ! {
    const NUM_LOOPS: u64 = 10;
    /// Milliseconds before the whole run is declared wedged
    const RUN_TIMEOUT_MS: u32 = 60_000;

    /// A self-re-enqueueing watchdog: panics once the deadline passes
    fn watchdog(deadline: u32) {
        assert!(board::timer::ticks_ms() < deadline, "Test run timed out");
        kernel::event::schedule_event(move || watchdog(deadline));
    }
    let deadline = board::timer::ticks_ms() + RUN_TIMEOUT_MS;
    kernel::event::schedule_event(move || watchdog(deadline));

    println!("Running {} tests", tests.len());

    for test in tests {
        for i in 1..=NUM_LOOPS {
            println!("[{}/{}] {}:", i, NUM_LOOPS, test.name);

            // Run the actual test.
            (test.test)();

            println!(".... PASSED");
        }
    }

    architecture::shutdown(0);
}

/// Registers a test under the given name
#[macro_export]
macro_rules! add_test {
    ($name: ident, $test: block) => {
        #[test_case]
        const $name: $crate::TestCase = $crate::TestCase {
            name: stringify!($name),
            test: || $test,
        };
    };
}

/// Represents a test to run
pub struct TestCase {
    /// Name of the test.
    pub name: &'static str,

    /// Function pointer to the test.
    pub test: fn(),
}

#[cfg(test)]
#[no_mangle]
fn kernel_main() {
    test_main();
}
