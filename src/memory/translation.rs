//! The 4 KiB-granule, four-level AArch64 translation-table manager.
//!
//! Tables are trees of frames: every level holds 512 64-bit descriptors, and
//! a walk peels nine bits of the virtual address per level (bit positions
//! 39, 30, 21 and 12). Intermediate tables are allocated on demand during
//! `map` and deliberately not reclaimed by `unmap`; a process frees its whole
//! tree at once on teardown, which bounds the leakage by process lifetime.

use super::frames::{self, Frame, OutOfMemory, FRAME_SIZE};
use crate::architecture::machine;
use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::{TTBR0_EL1, TTBR1_EL1};
use bitfield_struct::bitfield;
use core::arch::asm;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use tock_registers::interfaces::Writeable;

/// Number of descriptors in one table level
const DESCRIPTORS_PER_TABLE: usize = FRAME_SIZE / core::mem::size_of::<u64>();
/// Bit positions at which each level's nine index bits start
const LEVEL_SHIFTS: [u32; 4] = [39, 30, 21, 12];

/// Index into `MAIR_EL1` describing a memory region
#[derive(Debug, FromPrimitive, ToPrimitive)]
enum MemoryAttribute {
    /// Write-back cacheable ordinary RAM
    Normal = 0,
    /// Device nGnRnE, for memory-mapped peripherals
    Device = 1,
}

impl From<u64> for MemoryAttribute {
    fn from(value: u64) -> Self {
        FromPrimitive::from_u64(value).expect("Invalid memory attribute provided")
    }
}

impl From<MemoryAttribute> for u64 {
    fn from(value: MemoryAttribute) -> Self {
        // SAFETY: `MemoryAttribute` can always fit into a `u64`
        unsafe { ToPrimitive::to_u64(&value).unwrap_unchecked() }
    }
}

/// Requested properties of a new mapping. The default is a kernel-only,
/// writeable, executable, normal-memory page.
#[bitfield(u32)]
pub struct MappingFlags {
    /// Forbid instruction fetches from EL0 (`UXN`)
    pub execute_never: bool,
    /// Forbid writes
    pub read_only: bool,
    /// Allow EL0 loads and stores
    pub unprivileged: bool,
    /// Use the device (nGnRnE) attribute instead of normal memory
    pub device_memory: bool,
    #[bits(28)]
    __: u32,
}

/// Leaf page sizes the API names. Only the 4 KiB granule is implemented;
/// requests for any other size are a policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Kb4,
    Kb16,
    Kb64,
    Mb2,
    Gb1,
}

/// A level-3 descriptor mapping one 4 KiB page
#[bitfield(u64)]
pub struct PageDescriptor {
    /// Whether or not this descriptor is in use
    pub valid: bool,
    /// Must be 1 for a page descriptor; 0 would denote a (reserved) block
    pub page: bool,
    /// Attribute index into `MAIR_EL1`
    #[bits(3)]
    memory_type: MemoryAttribute,
    _non_secure: bool,
    /// `AP[1]`: whether EL0 can access this page
    pub el0_accessible: bool,
    /// `AP[2]`: disables writes when set
    pub read_only: bool,
    /// Shareability domain; kernel RAM mappings are inner shareable so the
    /// cores stay coherent
    #[bits(2)]
    shareability: u8,
    /// Access flag; a cleared flag faults on first use, so mappings are
    /// created with it set
    pub accessed: bool,
    _not_global: bool,
    /// Physical frame number of the mapped page
    #[bits(36)]
    pub frame_number: u64,
    #[bits(2)]
    _res0: u8,
    _guarded: bool,
    _dirty: bool,
    _contiguous: bool,
    /// Whether EL1 is forbidden from executing this page
    pub privileged_execute_never: bool,
    /// Whether EL0 is forbidden from executing this page
    pub unprivileged_execute_never: bool,
    #[bits(9)]
    _ignored: u16,
}

/// A descriptor at levels 0-2 pointing to the next table level
#[bitfield(u64)]
struct TableDescriptor {
    /// Whether or not this descriptor is in use
    valid: bool,
    /// Must be 1 for a table descriptor; 0 would denote a block
    table: bool,
    #[bits(10)]
    _ignored_low: u16,
    /// Physical frame number of the child table
    #[bits(36)]
    frame_number: u64,
    #[bits(16)]
    _ignored_high: u16,
}

/// A decoded view of one raw descriptor slot
enum Descriptor {
    /// Nothing mapped here
    Invalid,
    /// An intermediate entry pointing at the next level's frame
    Table {
        /// Physical base address of the child table
        child: u64,
    },
    /// A leaf entry mapping a page
    Page(PageDescriptor),
}

impl Descriptor {
    /// Decodes a descriptor slot found at the given level
    fn decode(raw: u64, level: usize) -> Self {
        if raw & 0b1 == 0 {
            return Self::Invalid;
        }
        if level < 3 {
            assert!(
                raw & 0b10 != 0,
                "Level {level} descriptor {raw:#X} is not a table descriptor"
            );
            Self::Table {
                child: TableDescriptor::from(raw).frame_number() << LEVEL_SHIFTS[3],
            }
        } else {
            assert!(
                raw & 0b10 != 0,
                "Level 3 descriptor {raw:#X} is not a page descriptor"
            );
            Self::Page(PageDescriptor::from(raw))
        }
    }
}

/// A four-level translation tree rooted at one frame.
///
/// The tree edits raw physical frames through the kernel's upper-half
/// window, so the methods take `&self`; exclusivity is the owner's problem
/// (each tree is owned either by a `Process` or by the kernel itself).
pub struct TranslationTable {
    /// Physical address of the level-0 table
    base: u64,
}

impl TranslationTable {
    /// Creates an empty tree with a freshly allocated root
    pub fn new() -> Result<Self, OutOfMemory> {
        let root = frames::allocator().allocate()?;
        let base = root.physical_base();
        // The root's receipt is absorbed into the tree; `release` reclaims it
        core::mem::forget(root);
        Ok(Self { base })
    }

    /// The physical address of the root table, as written into a `TTBRn`
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Returns a raw pointer to the `index`th slot of the table frame at
    /// physical address `table`
    fn slot(table: u64, index: usize) -> *mut u64 {
        assert!(index < DESCRIPTORS_PER_TABLE);
        (machine::physical_to_kernel(table) as *mut u64).wrapping_add(index)
    }

    /// The descriptor index of `va` at the given level
    fn index_for(va: u64, level: usize) -> usize {
        usize::try_from((va >> LEVEL_SHIFTS[level]) & 0x1FF)
            .expect("Nine bits should fit into a usize")
    }

    /// Walks to the level-3 slot covering `va`.
    ///
    /// With `allocate` set, missing intermediate tables are created along the
    /// way; otherwise the walk stops and returns `None` at the first invalid
    /// entry.
    fn walk(&self, va: u64, allocate: bool) -> Result<Option<*mut u64>, OutOfMemory> {
        let mut table = self.base;
        for level in 0..3 {
            let entry = Self::slot(table, Self::index_for(va, level));
            // SAFETY: `entry` points into a live table frame owned by this tree
            let raw = unsafe { entry.read_volatile() };
            table = match Descriptor::decode(raw, level) {
                Descriptor::Table { child } => child,
                Descriptor::Invalid => {
                    if !allocate {
                        return Ok(None);
                    }
                    let child = frames::allocator().allocate()?;
                    let base = child.physical_base();
                    core::mem::forget(child);
                    let descriptor = TableDescriptor::new()
                        .with_valid(true)
                        .with_table(true)
                        .with_frame_number(base >> LEVEL_SHIFTS[3]);
                    // SAFETY: As above, and the new frame is exclusively ours
                    unsafe {
                        entry.write_volatile(descriptor.into());
                    }
                    base
                }
                Descriptor::Page(_) => unreachable!("decode panics on malformed level entries"),
            };
        }
        Ok(Some(Self::slot(table, Self::index_for(va, 3))))
    }

    /// Installs a leaf mapping from `va` to the specific physical frame `pa`
    pub fn map_to(
        &self,
        va: u64,
        pa: u64,
        flags: MappingFlags,
        page_size: PageSize,
    ) -> Result<(), OutOfMemory> {
        assert_eq!(
            page_size,
            PageSize::Kb4,
            "Only the 4 KiB granule is implemented"
        );
        assert_eq!(va % FRAME_SIZE as u64, 0);
        assert_eq!(pa % FRAME_SIZE as u64, 0);

        // Kernel-half RAM is shared by all four cores; process pages are
        // only ever touched by one core at a time and stay non-shareable
        let shareability = if flags.unprivileged() || flags.device_memory() {
            0b00
        } else {
            0b11
        };
        let descriptor = PageDescriptor::new()
            .with_valid(true)
            .with_page(true)
            .with_memory_type(if flags.device_memory() {
                MemoryAttribute::Device
            } else {
                MemoryAttribute::Normal
            })
            .with_el0_accessible(flags.unprivileged())
            .with_read_only(flags.read_only())
            .with_shareability(shareability)
            .with_accessed(true)
            .with_unprivileged_execute_never(flags.execute_never())
            .with_frame_number(pa >> LEVEL_SHIFTS[3]);

        let entry = self
            .walk(va, true)?
            .expect("An allocating walk always reaches level 3");
        // SAFETY: `entry` points into a live table frame owned by this tree
        unsafe {
            entry.write_volatile(descriptor.into());
        }
        Ok(())
    }

    /// Allocates a fresh frame and installs a leaf mapping for `va`,
    /// returning the frame's physical address
    pub fn map(
        &self,
        va: u64,
        flags: MappingFlags,
        page_size: PageSize,
    ) -> Result<u64, OutOfMemory> {
        let frame = frames::allocator().allocate()?;
        let pa = frame.physical_base();
        match self.map_to(va, pa, flags, page_size) {
            Ok(()) => {
                core::mem::forget(frame);
                Ok(pa)
            }
            Err(err) => {
                frames::allocator().free(frame);
                Err(err)
            }
        }
    }

    /// Tears down the leaf mapping for `va`.
    ///
    /// A no-op if any intermediate entry is invalid; intermediate tables are
    /// never freed here.
    pub fn unmap(&self, va: u64, page_size: PageSize) {
        assert_eq!(
            page_size,
            PageSize::Kb4,
            "Only the 4 KiB granule is implemented"
        );
        let Ok(Some(entry)) = self.walk(va, false) else {
            return;
        };
        // SAFETY: `entry` points into a live table frame owned by this tree
        unsafe {
            entry.write_volatile(0);
        }
    }

    /// Translates `va` to its mapped physical address, if any
    pub fn translate(&self, va: u64) -> Option<u64> {
        let offset = va % FRAME_SIZE as u64;
        self.leaf_descriptor(va & !(FRAME_SIZE as u64 - 1))
            .map(|descriptor| (descriptor.frame_number() << LEVEL_SHIFTS[3]) + offset)
    }

    /// Reads the level-3 descriptor covering `va`, if the whole walk is valid
    pub fn leaf_descriptor(&self, va: u64) -> Option<PageDescriptor> {
        let entry = self.walk(va, false).ok()??;
        // SAFETY: `entry` points into a live table frame owned by this tree
        match Descriptor::decode(unsafe { entry.read_volatile() }, 3) {
            Descriptor::Page(descriptor) => Some(descriptor),
            Descriptor::Invalid => None,
            Descriptor::Table { .. } => unreachable!("Level 3 cannot hold table descriptors"),
        }
    }

    /// Installs this tree as the lower-half (per-process) table
    pub fn activate_ttbr0(&self) {
        TTBR0_EL1.set(self.base);
        barrier::isb(barrier::SY);
    }

    /// Installs this tree as the upper-half (kernel) table
    ///
    /// # Safety
    ///
    /// The tree must map every kernel address in use, including the code
    /// performing this call
    pub unsafe fn activate_ttbr1(&self) {
        TTBR1_EL1.set(self.base);
        barrier::isb(barrier::SY);
    }

    /// Frees every leaf frame and table frame in the tree, root included.
    ///
    /// # Safety
    ///
    /// The tree must no longer be installed in any `TTBRn`, and every mapped
    /// frame must have been exclusively owned by this tree.
    pub unsafe fn release(&self) {
        // SAFETY: Per this function's contract
        unsafe {
            Self::release_level(self.base, 0);
        }
        // SAFETY: The root was allocated by `new`
        frames::allocator().free(unsafe { Frame::from_base(self.base) });
    }

    /// Recursively frees the subtree rooted at the table frame `table`
    ///
    /// # Safety
    ///
    /// See [`Self::release`]
    unsafe fn release_level(table: u64, level: usize) {
        for index in 0..DESCRIPTORS_PER_TABLE {
            let entry = Self::slot(table, index);
            // SAFETY: `entry` points into a live table frame owned by this tree
            match Descriptor::decode(unsafe { entry.read_volatile() }, level) {
                Descriptor::Invalid => {}
                Descriptor::Table { child } => {
                    // SAFETY: Recursing into an exclusively owned child
                    unsafe {
                        Self::release_level(child, level + 1);
                    }
                    // SAFETY: The child frame was allocated by `walk`
                    frames::allocator().free(unsafe { Frame::from_base(child) });
                }
                Descriptor::Page(descriptor) => {
                    let pa = descriptor.frame_number() << LEVEL_SHIFTS[3];
                    // SAFETY: Leaf frames are owned by the tree per the
                    // function contract
                    frames::allocator().free(unsafe { Frame::from_base(pa) });
                }
            }
        }
    }
}

/// Flushes all cached translations on the executing core.
///
/// Required once after the kernel tables are populated; per-process `TTBR0`
/// swaps get by without it because at most one process runs per core and the
/// lower half is never shared.
pub fn invalidate_tlb() {
    // SAFETY: TLB maintenance has no side effects beyond translation caches
    unsafe {
        asm!("dsb sy", "tlbi vmalle1", "dsb sy", "isb");
    }
}
