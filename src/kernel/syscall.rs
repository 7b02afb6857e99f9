//! The numbered system-call surface.
//!
//! The selector is the `svc` immediate; a zero immediate defers to `x8`,
//! Linux-style. Arguments arrive in `x0`-`x7` and the result replaces `x0`.
//! Errors are the small negative codes of [`SystemCallError`]; every
//! resource-exhaustion or validation failure is converted to one here rather
//! than surfacing as a kernel fault.

use crate::architecture::exception::TrapFrame;
use crate::architecture::exception_handlers::Directive;
use crate::kernel::event;
use crate::{log, process};
use aarch64_cpu::asm::barrier;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Error codes shared by all system calls
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCallError {
    NotImplemented = -2,
    InvalidSystemCall = -3,
    InvalidOperation = -4,
    InvalidPointer = -5,
    FileNotFound = -6,
    InvalidFd = -7,
    InvalidSeekType = -8,
    DataOverflow = -9,
    InvalidFilePos = -10,
}

/// Interpretations of a seek offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SeekKind {
    /// From the start of the file
    Absolute = 2,
    /// From the current position
    Relative = 3,
    /// From the end of the file
    End = 4,
}

/// The call numbers of the ABI
#[derive(Debug, FromPrimitive)]
enum Call {
    Exit = 0,
    Yield = 1,
    Fork = 2,
    Join = 3,
    GetPid = 4,
    Open = 5,
    Close = 6,
    Read = 7,
    Write = 8,
    Seek = 9,
    Exec = 0xA,
}

/// Longest accepted path argument, terminator excluded
const PATH_LIMIT: usize = 255;

/// Dispatches a system call trapped from user mode.
///
/// Returns what the assembly stub should do next: `exit` and `yield` leave
/// the core to the event loop, everything else writes a result into the
/// frame's `x0` and resumes the caller.
pub fn handle(immediate: u16, frame: &mut TrapFrame) -> Directive {
    let number = if immediate != 0 {
        u64::from(immediate)
    } else {
        frame.registers[8]
    };

    let result = match Call::from_u64(number) {
        Some(Call::Exit) => return exit(frame),
        Some(Call::Yield) => return yield_current(frame),
        Some(Call::Open) => open(frame),
        Some(Call::Close) => close(frame),
        Some(Call::Read) => read(frame),
        Some(Call::Write) => write(frame),
        Some(Call::Seek) => seek(frame),
        Some(Call::Fork | Call::Join | Call::GetPid | Call::Exec) => {
            Err(SystemCallError::NotImplemented)
        }
        None => Err(SystemCallError::InvalidSystemCall),
    };

    frame.registers[0] = match result {
        Ok(value) => value as u64,
        Err(error) => (error as i64) as u64,
    };
    Directive::ReturnToUser
}

/// Call 0: tears the process down; the core reenters its event loop
fn exit(frame: &TrapFrame) -> Directive {
    log!("exit({})", frame.registers[0]);
    let process = process::take_current().expect("System calls only arrive from a process");
    drop(process);
    Directive::EnterEventLoop
}

/// Call 1: saves the register frame and reschedules the process; the freed
/// core reenters its event loop
fn yield_current(frame: &TrapFrame) -> Directive {
    log!("yield()");
    let process = process::take_current().expect("System calls only arrive from a process");
    process.save_state(frame);
    // The saved context must be visible before any core picks the work up
    barrier::dmb(barrier::SY);
    event::schedule_event(move || process.run());
    Directive::EnterEventLoop
}

/// Call 5: opens the file named by the C string in `x0`
fn open(frame: &TrapFrame) -> Result<i64, SystemCallError> {
    let process = process::current().expect("System calls only arrive from a process");
    let pointer = frame.registers[0];

    let mut bytes = alloc::vec::Vec::new();
    for offset in 0..=PATH_LIMIT as u64 {
        let address = pointer
            .checked_add(offset)
            .ok_or(SystemCallError::InvalidPointer)?;
        if !process.validate_user_range(address, 1) {
            return Err(SystemCallError::InvalidPointer);
        }
        // SAFETY: The byte was just validated as mapped, and the process's
        // address space is installed while its call is serviced
        let byte = unsafe { (address as *const u8).read() };
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    if bytes.len() > PATH_LIMIT {
        return Err(SystemCallError::InvalidPointer);
    }
    let path = core::str::from_utf8(&bytes).map_err(|_| SystemCallError::FileNotFound)?;

    process.open_file(path).map(|fd| fd as i64)
}

/// Call 6: closes the descriptor in `x0`
fn close(frame: &TrapFrame) -> Result<i64, SystemCallError> {
    let process = process::current().expect("System calls only arrive from a process");
    process.close_resource(frame.registers[0]).map(|()| 0)
}

/// Call 7: reads up to `x1` bytes into the buffer at `x0` from descriptor
/// `x2`
fn read(frame: &TrapFrame) -> Result<i64, SystemCallError> {
    let process = process::current().expect("System calls only arrive from a process");
    let (buffer, size, fd) = (frame.registers[0], frame.registers[1], frame.registers[2]);
    if !process.validate_user_range(buffer, size) {
        return Err(SystemCallError::InvalidPointer);
    }
    // SAFETY: The range was validated against the live address space, and
    // user pages stay mapped for the duration of the call
    let slice = unsafe {
        core::slice::from_raw_parts_mut(buffer as *mut u8, size as usize)
    };
    process
        .with_resource(fd, |resource| resource.read(slice))?
        .map(|count| count as i64)
}

/// Call 8: writes `x1` bytes from the buffer at `x0` to descriptor `x2`
fn write(frame: &TrapFrame) -> Result<i64, SystemCallError> {
    let process = process::current().expect("System calls only arrive from a process");
    let (buffer, size, fd) = (frame.registers[0], frame.registers[1], frame.registers[2]);
    if !process.validate_user_range(buffer, size) {
        return Err(SystemCallError::InvalidPointer);
    }
    // SAFETY: As in `read`
    let slice = unsafe { core::slice::from_raw_parts(buffer as *const u8, size as usize) };
    process
        .with_resource(fd, |resource| resource.write(slice))?
        .map(|count| count as i64)
}

/// Call 9: moves descriptor `x2`'s cursor by `x0`, interpreted per `x1`
fn seek(frame: &TrapFrame) -> Result<i64, SystemCallError> {
    let process = process::current().expect("System calls only arrive from a process");
    let (offset, kind, fd) = (frame.registers[0], frame.registers[1], frame.registers[2]);
    let kind = SeekKind::from_u64(kind).ok_or(SystemCallError::InvalidSeekType)?;
    process.with_resource(fd, |resource| resource.seek(offset as i64, kind))?
}
