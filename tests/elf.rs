#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(format_args_nl)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(libkernel::test_runner)]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use libkernel::add_test;
use libkernel::process::elf::{self, ElfError, LoadError};
use libkernel::process::Process;

#[no_mangle]
fn kernel_main() {
    test_main();
}

/// Size of the ELF header
const EHSIZE: usize = 64;
/// Size of one program header
const PHSIZE: usize = 56;
/// Entry point baked into the synthetic images
const ENTRY: u64 = 0x4000_0000;

/// One synthetic loadable segment
struct Segment {
    vaddr: u64,
    offset: u64,
    filesz: u64,
    memsz: u64,
    p_type: u32,
    fill: u8,
}

/// Builds a minimal valid 64-bit AArch64 executable image
fn build_elf(segments: &[Segment]) -> Vec<u8> {
    let body_end = segments
        .iter()
        .map(|s| (s.offset + s.filesz) as usize)
        .max()
        .unwrap_or(EHSIZE);
    let mut image = vec![0_u8; body_end.max(EHSIZE + segments.len() * PHSIZE)];

    image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    image[4] = 2; // 64-bit
    image[5] = 1; // little endian
    image[6] = 1; // header version
    image[16..18].copy_from_slice(&2_u16.to_le_bytes()); // executable
    image[18..20].copy_from_slice(&0xB7_u16.to_le_bytes()); // AArch64
    image[20..24].copy_from_slice(&1_u32.to_le_bytes());
    image[24..32].copy_from_slice(&ENTRY.to_le_bytes());
    image[32..40].copy_from_slice(&(EHSIZE as u64).to_le_bytes()); // phoff
    image[52..54].copy_from_slice(&(EHSIZE as u16).to_le_bytes());
    image[54..56].copy_from_slice(&(PHSIZE as u16).to_le_bytes());
    image[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes());
    // Section header count stays zero

    for (index, segment) in segments.iter().enumerate() {
        let at = EHSIZE + index * PHSIZE;
        image[at..at + 4].copy_from_slice(&segment.p_type.to_le_bytes());
        image[at + 4..at + 8].copy_from_slice(&0b101_u32.to_le_bytes()); // R+X
        image[at + 8..at + 16].copy_from_slice(&segment.offset.to_le_bytes());
        image[at + 16..at + 24].copy_from_slice(&segment.vaddr.to_le_bytes());
        image[at + 32..at + 40].copy_from_slice(&segment.filesz.to_le_bytes());
        image[at + 40..at + 48].copy_from_slice(&segment.memsz.to_le_bytes());
        image[at + 48..at + 56].copy_from_slice(&0x1000_u64.to_le_bytes());

        let start = segment.offset as usize;
        image[start..start + segment.filesz as usize].fill(segment.fill);
    }
    image
}

add_test!(two_segment_image_loads_completely, {
    let image = build_elf(&[
        Segment {
            vaddr: ENTRY,
            offset: 0x1000,
            filesz: 0x1000,
            memsz: 0x2000,
            p_type: 1,
            fill: 0x11,
        },
        Segment {
            vaddr: ENTRY + 0x2000,
            offset: 0x2000,
            filesz: 0x800,
            memsz: 0x800,
            p_type: 1,
            fill: 0x22,
        },
    ]);

    let process = Process::new().expect("Processes should be constructible");
    elf::load(&image, &process).expect("The image should load");

    // Every page of both segments is mapped user-accessible
    assert!(process.validate_user_range(ENTRY, 0x2000));
    assert!(process.validate_user_range(ENTRY + 0x2000, 0x800));
    // And nothing beyond them
    assert!(!process.validate_user_range(ENTRY + 0x3000, 1));

    // Segment bodies landed; bytes past filesz read back zero
    let mut byte = [0_u8];
    process.read_bytes(ENTRY, &mut byte);
    assert_eq!(byte[0], 0x11);
    process.read_bytes(ENTRY + 0xFFF, &mut byte);
    assert_eq!(byte[0], 0x11);
    process.read_bytes(ENTRY + 0x1000, &mut byte);
    assert_eq!(byte[0], 0);
    process.read_bytes(ENTRY + 0x1FFF, &mut byte);
    assert_eq!(byte[0], 0);
    process.read_bytes(ENTRY + 0x2000, &mut byte);
    assert_eq!(byte[0], 0x22);

    assert_eq!(process.saved_pc(), ENTRY);
});

add_test!(rejected_images_leave_the_process_untouched, {
    let reject = |image: Vec<u8>, expected: ElfError| {
        let process = Process::new().expect("Processes should be constructible");
        let before_pc = process.saved_pc();
        match elf::load(&image, &process) {
            Err(LoadError::Elf(err)) => assert_eq!(err, expected),
            other => panic!("Expected a rejection, got {:?}", other.map(|()| "success")),
        }
        assert_eq!(process.saved_pc(), before_pc);
        assert!(!process.validate_user_range(ENTRY, 1));
    };

    // An unknown program header type is unsupported
    reject(
        build_elf(&[Segment {
            vaddr: ENTRY,
            offset: 0x1000,
            filesz: 0x100,
            memsz: 0x100,
            p_type: 6,
            fill: 0x33,
        }]),
        ElfError::UnsupportedProgramHeaderType,
    );

    // memsz may never undercut filesz
    reject(
        build_elf(&[Segment {
            vaddr: ENTRY,
            offset: 0x1000,
            filesz: 0x200,
            memsz: 0x100,
            p_type: 1,
            fill: 0x33,
        }]),
        ElfError::InvalidMemSize,
    );

    // Unaligned target addresses are not loadable
    reject(
        build_elf(&[Segment {
            vaddr: ENTRY + 0x10,
            offset: 0x1000,
            filesz: 0x100,
            memsz: 0x100,
            p_type: 1,
            fill: 0x33,
        }]),
        ElfError::UnsupportedPageUnalignedVaddr,
    );

    // A mangled signature is structurally invalid
    let mut bad_magic = build_elf(&[]);
    bad_magic[1] = b'F';
    reject(bad_magic, ElfError::InvalidSignature);

    // A truncated image cannot even hold its header
    reject(vec![0x7F; 16], ElfError::InvalidFileSize);
});

add_test!(null_segments_are_skipped, {
    let image = build_elf(&[
        Segment {
            vaddr: 0,
            offset: 0,
            filesz: 0,
            memsz: 0,
            p_type: 0,
            fill: 0,
        },
        Segment {
            vaddr: ENTRY,
            offset: 0x1000,
            filesz: 0x100,
            memsz: 0x100,
            p_type: 1,
            fill: 0x44,
        },
    ]);

    let process = Process::new().expect("Processes should be constructible");
    elf::load(&image, &process).expect("The image should load");
    assert!(process.validate_user_range(ENTRY, 0x100));
    assert!(!process.validate_user_range(0, 1));
});
