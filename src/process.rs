//! The process abstraction: an address space, a saved register context and a
//! table of IO resources, bridging kernel services to user mode.

pub mod elf;
pub mod resource;

use crate::architecture::exception::TrapFrame;
use crate::architecture::machine;
use crate::kernel::syscall::SystemCallError;
use crate::kernel::PerCore;
use crate::memory::{FRAME_SIZE, MappingFlags, OutOfMemory, PageSize, TranslationTable};
use crate::sync::SpinLock;
use crate::{fs, log};
use aarch64_cpu::registers::{ELR_EL1, SPSR_EL1, SP_EL0};
use alloc::sync::Arc;
use resource::Resource;
use tock_registers::interfaces::{Readable, Writeable};

extern "C" {
    /// Restores a register frame and drops to EL0 (defined in exception.s)
    fn enter_user(frame: *const u64) -> !;
}

/// Size of a process's IO-resource table
pub const NUM_IO_RESOURCES: usize = 16;

/// Exclusive top of the lower half, where the user stack begins (growing
/// down)
const USER_STACK_TOP: u64 = 1 << 48;
/// Bytes of stack mapped for every process
const USER_STACK_SIZE: u64 = 0x100_0000;

/// The registers a process runs with, captured at every trap
#[repr(C)]
pub struct Context {
    /// General registers `x0`-`x30` plus one padding slot, laid out exactly
    /// like a trap frame
    pub registers: [u64; 32],
    /// Program counter (`ELR_EL1` on entry)
    pub pc: u64,
    /// User stack pointer (`SP_EL0`)
    pub sp: u64,
    /// Saved processor status (`SPSR_EL1`)
    pub status: u64,
}

impl Context {
    /// A context beginning execution at the given program counter.
    ///
    /// The status word selects EL0 with interrupts unmasked.
    const fn starting_at(pc: u64) -> Self {
        Self {
            registers: [0; 32],
            pc,
            sp: USER_STACK_TOP,
            status: 0,
        }
    }
}

/// A user process. At most one is active per core; destruction happens only
/// once no core holds a reference, which the `Arc` enforces.
pub struct Process {
    /// The lower-half address space, exclusively owned by this process
    translation_table: TranslationTable,
    /// The saved register context, valid while the process is not running
    context: SpinLock<Context>,
    /// The IO-resource table; slots 0-2 are the standard streams
    resources: SpinLock<[Option<Resource>; NUM_IO_RESOURCES]>,
}

/// The process currently occupying each core's user context
static ACTIVE: PerCore<Option<Arc<Process>>> = PerCore::new_with([None, None, None, None]);

/// Clones a handle to the executing core's active process
pub fn current() -> Option<Arc<Process>> {
    ACTIVE.with_current(|active| active.clone())
}

/// Removes and returns the executing core's active process
pub fn take_current() -> Option<Arc<Process>> {
    ACTIVE.with_current(Option::take)
}

impl Process {
    /// Creates a process with a fresh address space, a mapped stack window
    /// and the standard streams in resource slots 0-2. The entry point is
    /// supplied later, typically by the ELF loader.
    pub fn new() -> Result<Arc<Self>, OutOfMemory> {
        let process = Self {
            translation_table: TranslationTable::new()?,
            context: SpinLock::new(Context::starting_at(0)),
            resources: SpinLock::new([
                Some(Resource::StandardInput),
                Some(Resource::StandardOutput),
                Some(Resource::StandardError),
                None, None, None, None, None, None, None, None, None, None, None, None, None,
            ]),
        };

        let flags = MappingFlags::new().with_unprivileged(true);
        for page in (USER_STACK_TOP - USER_STACK_SIZE..USER_STACK_TOP).step_by(FRAME_SIZE) {
            process.translation_table.map(page, flags, PageSize::Kb4)?;
        }

        Ok(Arc::new(process))
    }

    /// Maps fresh user-accessible frames covering `[start, end)`, rounding
    /// `start` down to a page boundary. Pages already mapped are left alone.
    pub fn map_range(&self, start: u64, end: u64) -> Result<(), OutOfMemory> {
        let flags = MappingFlags::new().with_unprivileged(true);
        let mut page = start & !(FRAME_SIZE as u64 - 1);
        while page < end {
            if self.translation_table.leaf_descriptor(page).is_none() {
                self.translation_table.map(page, flags, PageSize::Kb4)?;
            }
            page += FRAME_SIZE as u64;
        }
        Ok(())
    }

    /// Stores the starting program counter in the saved context
    pub fn set_entry_point(&self, pc: u64) {
        self.context.lock().pc = pc;
    }

    /// Copies `bytes` into the process's memory at `va`, through the kernel's
    /// physical window. The range must already be mapped.
    pub fn write_bytes(&self, va: u64, bytes: &[u8]) {
        let mut written = 0_usize;
        while written < bytes.len() {
            let address = va + written as u64;
            let pa = self
                .translation_table
                .translate(address)
                .expect("Target ranges should be mapped before writing");
            let chunk = usize::min(
                bytes.len() - written,
                FRAME_SIZE - (address as usize % FRAME_SIZE),
            );
            // SAFETY: The frame is exclusively owned by this process's
            // address space and visible through the kernel window
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes[written..].as_ptr(),
                    machine::physical_to_kernel(pa) as *mut u8,
                    chunk,
                );
            }
            written += chunk;
        }
    }

    /// Copies bytes out of the process's memory at `va`, through the
    /// kernel's physical window. The range must already be mapped.
    pub fn read_bytes(&self, va: u64, buffer: &mut [u8]) {
        let mut read = 0_usize;
        while read < buffer.len() {
            let address = va + read as u64;
            let pa = self
                .translation_table
                .translate(address)
                .expect("Source ranges should be mapped before reading");
            let chunk = usize::min(
                buffer.len() - read,
                FRAME_SIZE - (address as usize % FRAME_SIZE),
            );
            // SAFETY: The frame belongs to this process and is visible
            // through the kernel window
            unsafe {
                core::ptr::copy_nonoverlapping(
                    machine::physical_to_kernel(pa) as *const u8,
                    buffer[read..].as_mut_ptr(),
                    chunk,
                );
            }
            read += chunk;
        }
    }

    /// The program counter the process will resume at
    pub fn saved_pc(&self) -> u64 {
        self.context.lock().pc
    }

    /// Whether `[va, va + len)` lies in the lower half and every touched page
    /// is mapped user-accessible
    pub fn validate_user_range(&self, va: u64, len: u64) -> bool {
        let Some(end) = va.checked_add(len) else {
            return false;
        };
        if end > USER_STACK_TOP {
            return false;
        }
        if len == 0 {
            return true;
        }
        let mut page = va & !(FRAME_SIZE as u64 - 1);
        while page < end {
            match self.translation_table.leaf_descriptor(page) {
                Some(descriptor) if descriptor.el0_accessible() => {}
                _ => return false,
            }
            page += FRAME_SIZE as u64;
        }
        true
    }

    /// Copies the trap frame and the exception system registers back into
    /// the saved context. Called on the trap path before the process loses
    /// its core.
    pub fn save_state(&self, frame: &TrapFrame) {
        let mut context = self.context.lock();
        context.registers = frame.registers;
        context.pc = ELR_EL1.get();
        context.sp = SP_EL0.get();
        context.status = SPSR_EL1.get();
    }

    /// Resumes the process on the executing core: restores the exception
    /// return state, installs the address space, records the process as the
    /// core's active one and drops to EL0.
    pub fn run(self: Arc<Self>) -> ! {
        let registers = {
            let context = self.context.lock();
            ELR_EL1.set(context.pc);
            SP_EL0.set(context.sp);
            SPSR_EL1.set(context.status);
            context.registers
        };

        self.translation_table.activate_ttbr0();
        ACTIVE.with_current(|active| {
            assert!(
                active.replace(self).is_none(),
                "At most one process can occupy a core"
            );
        });

        log!("Entering process");
        // SAFETY: The context was fully staged above, and the frame outlives
        // the call because `enter_user` never returns to drop it
        unsafe { enter_user(registers.as_ptr()) }
    }

    /// Finds the lowest unused resource slot
    fn find_unused_fd(resources: &[Option<Resource>; NUM_IO_RESOURCES]) -> Option<usize> {
        resources.iter().position(Option::is_none)
    }

    /// Opens the named file into the lowest free descriptor slot
    pub fn open_file(&self, path: &str) -> Result<usize, SystemCallError> {
        let file = fs::open(path)?;
        let mut resources = self.resources.lock();
        let fd = Self::find_unused_fd(&resources).ok_or(SystemCallError::DataOverflow)?;
        resources[fd] = Some(Resource::File(file));
        Ok(fd)
    }

    /// Runs `f` on the resource in slot `fd`
    pub fn with_resource<R>(
        &self,
        fd: u64,
        f: impl FnOnce(&mut Resource) -> R,
    ) -> Result<R, SystemCallError> {
        let index = usize::try_from(fd).map_err(|_| SystemCallError::InvalidFd)?;
        let mut resources = self.resources.lock();
        let resource = resources
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(SystemCallError::InvalidFd)?;
        Ok(f(resource))
    }

    /// Closes the resource in slot `fd`. Closing an empty slot reports
    /// `InvalidFd`, which makes a second close of the same descriptor fail
    /// cleanly.
    pub fn close_resource(&self, fd: u64) -> Result<(), SystemCallError> {
        let index = usize::try_from(fd).map_err(|_| SystemCallError::InvalidFd)?;
        let mut resources = self.resources.lock();
        resources
            .get_mut(index)
            .ok_or(SystemCallError::InvalidFd)?
            .take()
            .map(drop)
            .ok_or(SystemCallError::InvalidFd)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // SAFETY: Nobody references the process anymore, so its table cannot
        // be installed on any core, and every frame in it was freshly
        // allocated for this process
        unsafe {
            self.translation_table.release();
        }
    }
}
