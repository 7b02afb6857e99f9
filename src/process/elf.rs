//! The 64-bit AArch64 ELF loader.
//!
//! Loading is strictly two-phase: the whole image, header and program
//! headers included, is validated and the mapping plan staged before the
//! target process is touched. A process handed back with any error is
//! byte-for-byte what it was on entry.

use super::Process;
use crate::memory::{FRAME_SIZE, OutOfMemory};
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::mem;
use core::ptr::NonNull;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Loader error codes. The discriminant bands match the ABI the kernel
/// reports: 0x40-0x7F for valid-but-unsupported images and 0x80-0xBF for
/// structurally invalid ones.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    UnsupportedBitMode = 0x40,
    UnsupportedEndianness = 0x41,
    UnsupportedElfType = 0x42,
    UnsupportedArchIsa = 0x43,
    UnsupportedSections = 0x44,
    UnsupportedProgramHeaderType = 0x45,
    UnsupportedSystemEndianness = 0x46,
    UnsupportedPageUnalignedVaddr = 0x47,

    InvalidFileSize = 0x80,
    InvalidSignature = 0x81,
    InvalidElfHeaderSize = 0x82,
    InvalidProgramHeaderSize = 0x83,
    InvalidProgramHeaderOffset = 0x84,
    InvalidMemSize = 0x85,
    InvalidDataOffset = 0x86,
}

impl ElfError {
    /// Whether the image might load on a richer loader
    pub const fn unsupported(self) -> bool {
        (self as u8) < 0x80
    }

    /// Whether the image itself is malformed
    pub const fn invalid(self) -> bool {
        (self as u8) >= 0x80
    }
}

/// Everything that can stop a load: a rejected image, or running out of
/// frames while committing an accepted one
#[derive(Debug, derive_more::From)]
pub enum LoadError {
    /// The image was rejected; the process is untouched
    Elf(ElfError),
    /// The frame pool ran dry mid-commit
    OutOfMemory(OutOfMemory),
}

/// Register width markers in the identification bytes
#[derive(Debug, FromPrimitive)]
enum BitVersion {
    Bit32 = 1,
    Bit64 = 2,
}

/// Encoding markers in the identification bytes
#[derive(Debug, FromPrimitive)]
enum Endian {
    Little = 1,
    Big = 2,
}

/// Program header kinds the loader understands
#[derive(Debug, FromPrimitive, PartialEq)]
enum SegmentKind {
    Null = 0,
    Load = 1,
}

/// The machine tag for AArch64
const ISA_AARCH64: u16 = 0xB7;

/// The complete 64-bit ELF header
#[repr(C)]
struct ElfHeader {
    /// Magic header; should equal `MAGIC` in a valid ELF
    magic: [u8; 4],
    /// Register width
    bit_version: u8,
    /// Endianness
    endian: u8,
    /// Version of the header - should be 1
    header_version: u8,
    /// ABI
    abi: u8,
    /// Padding
    __: [u8; 8],
    /// Type of ELF file
    obj_file: u16,
    /// ISA
    isa: u16,
    /// Version of ELF used
    elf_version: u32,
    /// Entry point of the executable
    entry: u64,
    /// Offset of the program headers from the start of the ELF
    program_header_offset: u64,
    /// Offset of the section headers from the start of the ELF
    section_header_offset: u64,
    flags: u32,
    /// Size of this header, in bytes
    elf_header_size: u16,
    /// Size of program headers, in bytes
    program_header_entry_size: u16,
    /// Number of program headers
    program_header_entry_count: u16,
    /// Size of section headers, in bytes
    section_header_entry_size: u16,
    /// Number of section headers
    section_header_entry_count: u16,
    section_header_names_index: u16,
}

impl ElfHeader {
    const MAGIC: [u8; 4] = [0x7F, 0x45, 0x4C, 0x46];
}

#[bitfield(u32)]
struct SegmentFlags {
    executable: bool,
    writeable: bool,
    readable: bool,
    #[bits(29)]
    __: u32,
}

/// ELF program headers, 64 bit version
#[repr(C)]
struct ProgramHeader {
    /// Type of program header
    p_type: u32,
    /// Flags associated with this segment
    flags: SegmentFlags,
    /// Offset of this segment, in bytes, in the ELF
    offset: u64,
    /// Virtual address to map the segment to
    va: u64,
    /// Ignored
    _pa: u64,
    /// Size of the segment, in bytes, in the ELF
    filesz: u64,
    /// Size of the virtual addressing range of this segment; bytes past
    /// `filesz` are zero-filled
    memsz: u64,
    /// Alignment of this segment
    align: u64,
}

/// One staged mapping decision, produced by validation and applied by the
/// commit pass
struct StagedSegment {
    /// Target virtual address
    va: u64,
    /// Byte range of the segment body within the image
    file_range: core::ops::Range<usize>,
    /// Total bytes of address space to back
    memsz: u64,
}

/// Reinterprets `bytes[offset..]` as a `T`, if there is room and the
/// alignment works out
fn view<T>(bytes: &[u8], offset: usize) -> Option<&T> {
    let end = offset.checked_add(mem::size_of::<T>())?;
    if end > bytes.len() {
        return None;
    }
    let pointer = NonNull::from(bytes.get(offset)?).cast::<T>();
    if !pointer.as_ptr().is_aligned() {
        return None;
    }
    // SAFETY: Checked for size and alignment above; the view's lifetime is
    // tied to the buffer, and every field of the viewed types tolerates
    // arbitrary bytes
    Some(unsafe { pointer.as_ref() })
}

/// Verifies at runtime that this system stores the low byte first, since all
/// field reinterpretation assumes it
fn system_is_little_endian() -> bool {
    let probe: u16 = 0x0102;
    probe.to_ne_bytes() == [0x02, 0x01]
}

/// Validates the image against the process-independent rules and stages its
/// mapping plan
fn validate(bytes: &[u8]) -> Result<(u64, Vec<StagedSegment>), ElfError> {
    if !system_is_little_endian() {
        return Err(ElfError::UnsupportedSystemEndianness);
    }

    let header: &ElfHeader = view(bytes, 0).ok_or(ElfError::InvalidFileSize)?;
    if header.magic != ElfHeader::MAGIC {
        return Err(ElfError::InvalidSignature);
    }
    match BitVersion::from_u8(header.bit_version) {
        Some(BitVersion::Bit64) => {}
        _ => return Err(ElfError::UnsupportedBitMode),
    }
    match Endian::from_u8(header.endian) {
        Some(Endian::Little) => {}
        _ => return Err(ElfError::UnsupportedEndianness),
    }
    if header.isa != ISA_AARCH64 {
        return Err(ElfError::UnsupportedArchIsa);
    }
    if usize::from(header.elf_header_size) != mem::size_of::<ElfHeader>() {
        return Err(ElfError::InvalidElfHeaderSize);
    }
    if usize::from(header.program_header_entry_size) != mem::size_of::<ProgramHeader>() {
        return Err(ElfError::InvalidProgramHeaderSize);
    }
    if header.section_header_entry_count != 0 {
        return Err(ElfError::UnsupportedSections);
    }

    let offset =
        usize::try_from(header.program_header_offset).map_err(|_| ElfError::InvalidProgramHeaderOffset)?;
    let count = usize::from(header.program_header_entry_count);

    let mut staged = Vec::with_capacity(count);
    for index in 0..count {
        let header_offset = index
            .checked_mul(mem::size_of::<ProgramHeader>())
            .and_then(|o| o.checked_add(offset))
            .ok_or(ElfError::InvalidProgramHeaderOffset)?;
        let segment: &ProgramHeader =
            view(bytes, header_offset).ok_or(ElfError::InvalidProgramHeaderOffset)?;

        match SegmentKind::from_u32(segment.p_type) {
            Some(SegmentKind::Null) => continue,
            Some(SegmentKind::Load) => {}
            None => return Err(ElfError::UnsupportedProgramHeaderType),
        }

        if segment.memsz < segment.filesz {
            return Err(ElfError::InvalidMemSize);
        }
        // The whole span must fit in the lower (user) half
        match segment.va.checked_add(segment.memsz) {
            Some(end) if end <= 1 << 48 => {}
            _ => return Err(ElfError::InvalidMemSize),
        }
        if segment.va % FRAME_SIZE as u64 != 0 {
            return Err(ElfError::UnsupportedPageUnalignedVaddr);
        }
        let start = usize::try_from(segment.offset).map_err(|_| ElfError::InvalidDataOffset)?;
        let len = usize::try_from(segment.filesz).map_err(|_| ElfError::InvalidDataOffset)?;
        let end = start.checked_add(len).ok_or(ElfError::InvalidDataOffset)?;
        if end > bytes.len() {
            return Err(ElfError::InvalidDataOffset);
        }

        staged.push(StagedSegment {
            va: segment.va,
            file_range: start..end,
            memsz: segment.memsz,
        });
    }

    Ok((header.entry, staged))
}

/// Loads the image into the process: maps every `LOAD` segment, copies its
/// body, and points the saved program counter at the entry.
///
/// Bytes between `filesz` and `memsz` read as zero because segment frames
/// come out of the allocator zeroed.
pub fn load(bytes: &[u8], process: &Process) -> Result<(), LoadError> {
    let (entry, staged) = validate(bytes)?;

    for segment in &staged {
        process.map_range(segment.va, segment.va + segment.memsz)?;
        process.write_bytes(segment.va, &bytes[segment.file_range.clone()]);
    }
    process.set_entry_point(entry);
    Ok(())
}
