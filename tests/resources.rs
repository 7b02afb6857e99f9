#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(format_args_nl)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(libkernel::test_runner)]

extern crate alloc;

use libkernel::add_test;
use libkernel::kernel::syscall::{SeekKind, SystemCallError};
use libkernel::process::resource::{FileResource, Resource};
use libkernel::process::Process;

#[no_mangle]
fn kernel_main() {
    test_main();
}

add_test!(file_reads_advance_the_cursor, {
    let mut file = Resource::File(FileResource::new(b"abcdefgh".to_vec()));

    let mut buffer = [0_u8; 3];
    assert_eq!(file.read(&mut buffer), Ok(3));
    assert_eq!(&buffer, b"abc");
    assert_eq!(file.read(&mut buffer), Ok(3));
    assert_eq!(&buffer, b"def");
    assert_eq!(file.read(&mut buffer), Ok(2));
    assert_eq!(&buffer[..2], b"gh");
    // At the end, reads produce nothing rather than failing
    assert_eq!(file.read(&mut buffer), Ok(0));
});

add_test!(file_seeks_stay_within_bounds, {
    let mut file = Resource::File(FileResource::new(b"0123456789".to_vec()));

    assert_eq!(file.seek(4, SeekKind::Absolute), Ok(4));
    assert_eq!(file.seek(3, SeekKind::Relative), Ok(7));
    assert_eq!(file.seek(-2, SeekKind::End), Ok(8));
    let mut buffer = [0_u8; 4];
    assert_eq!(file.read(&mut buffer), Ok(2));
    assert_eq!(&buffer[..2], b"89");

    // Violating 0 <= pos <= size is refused and leaves the cursor alone
    assert_eq!(
        file.seek(-1, SeekKind::Absolute),
        Err(SystemCallError::InvalidFilePos)
    );
    assert_eq!(
        file.seek(1, SeekKind::End),
        Err(SystemCallError::InvalidFilePos)
    );
    assert_eq!(file.seek(0, SeekKind::Relative), Ok(10));

    // Writing into a buffered file is not wired up
    assert_eq!(file.write(b"x"), Err(SystemCallError::NotImplemented));
});

add_test!(standard_streams_reject_misuse, {
    let mut input = Resource::StandardInput;
    let mut buffer = [0_u8; 4];
    assert_eq!(input.read(&mut buffer), Err(SystemCallError::NotImplemented));
    assert_eq!(input.write(b"x"), Err(SystemCallError::InvalidOperation));
    assert_eq!(
        input.seek(0, SeekKind::Absolute),
        Err(SystemCallError::InvalidOperation)
    );

    let mut output = Resource::StandardOutput;
    assert_eq!(output.read(&mut buffer), Err(SystemCallError::InvalidOperation));
    assert_eq!(output.write(b"standard output says hi\n"), Ok(24));
    assert_eq!(
        output.seek(0, SeekKind::End),
        Err(SystemCallError::InvalidOperation)
    );
});

add_test!(descriptor_slots_close_exactly_once, {
    let process = Process::new().expect("Processes should be constructible");

    // The standard streams are pre-populated
    for fd in 0..3 {
        assert!(process.with_resource(fd, |_| ()).is_ok());
    }
    // Everything else starts empty
    for fd in 3..16 {
        assert_eq!(
            process.with_resource(fd, |_| ()).err(),
            Some(SystemCallError::InvalidFd)
        );
    }
    assert_eq!(
        process.with_resource(16, |_| ()).err(),
        Some(SystemCallError::InvalidFd)
    );

    // Closing works once; the second close of the same slot reports the
    // descriptor as gone
    assert!(process.close_resource(1).is_ok());
    assert_eq!(
        process.close_resource(1),
        Err(SystemCallError::InvalidFd)
    );
    assert_eq!(
        process.with_resource(1, |_| ()).err(),
        Some(SystemCallError::InvalidFd)
    );

    // Without a mounted volume, opening reports file-not-found
    assert_eq!(
        process.open_file("anything").err(),
        Some(SystemCallError::FileNotFound)
    );
});

add_test!(user_ranges_validate_against_the_address_space, {
    let process = Process::new().expect("Processes should be constructible");
    let stack_top: u64 = 1 << 48;

    // The stack window is mapped and user-accessible
    assert!(process.validate_user_range(stack_top - 4096, 4096));
    assert!(process.validate_user_range(stack_top - 8, 8));
    // Nothing is mapped at the bottom of the address space
    assert!(!process.validate_user_range(0, 8));
    // Ranges may not leave the lower half
    assert!(!process.validate_user_range(stack_top - 4, 8));
    assert!(!process.validate_user_range(u64::MAX - 4, 8));
    // Empty ranges are trivially fine
    assert!(process.validate_user_range(stack_top - 4096, 0));
});
