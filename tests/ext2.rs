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
use libkernel::fs::device::RamDisk;
use libkernel::fs::ext2::{Ext2, Ext2Error, ROOT_INODE};

#[no_mangle]
fn kernel_main() {
    test_main();
}

/// Geometry of the synthetic volume: 1 KiB blocks, one block group
const BLOCK_SIZE: usize = 1024;
const BLOCK_COUNT: u32 = 64;
const INODE_COUNT: u32 = 32;
/// Blocks 1-10 are occupied: superblock, BGDT, bitmaps, a 4-block inode
/// table, the root directory and the payload of `foo`
const USED_BLOCKS: u32 = 10;
/// Inodes 1-4 are occupied: the reserved inode, the root, `foo` and `holey`
const USED_INODES: u32 = 4;

const PAYLOAD: &[u8] = b"frame by frame, block by block\n";

/// Writes a little-endian `u32` into the image
fn put_u32(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Writes a little-endian `u16` into the image
fn put_u16(image: &mut [u8], at: usize, value: u16) {
    image[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

/// Fills in one on-disk inode record; the inode table starts at block 5
fn put_inode(image: &mut [u8], number: u32, mode: u16, size: u32, first_block: u32) {
    let at = 5 * BLOCK_SIZE + (number as usize - 1) * 128;
    put_u16(image, at, mode);
    put_u32(image, at + 4, size);
    put_u16(image, at + 26, 1); // hard links
    put_u32(image, at + 40, first_block); // direct[0]
}

/// Appends a directory entry at `at`, returning the next free offset
fn put_dir_entry(image: &mut [u8], at: usize, inode: u32, name: &[u8]) -> usize {
    let record = (8 + name.len()).div_ceil(4) * 4;
    put_u32(image, at, inode);
    put_u16(image, at + 4, record as u16);
    image[at + 6] = name.len() as u8;
    image[at + 7] = 1;
    image[at + 8..at + 8 + name.len()].copy_from_slice(name);
    at + record
}

/// Builds a small consistent volume holding `foo` (with a payload) and
/// `holey` (all holes)
fn build_image() -> RamDisk {
    let mut image = vec![0_u8; BLOCK_COUNT as usize * BLOCK_SIZE];

    // Superblock, at byte 1024
    let sb = BLOCK_SIZE;
    put_u32(&mut image, sb, INODE_COUNT);
    put_u32(&mut image, sb + 4, BLOCK_COUNT);
    put_u32(&mut image, sb + 24, 0); // 1024 << 0
    put_u32(&mut image, sb + 32, BLOCK_COUNT);
    put_u32(&mut image, sb + 40, INODE_COUNT);
    put_u16(&mut image, sb + 88, 128);
    put_u16(&mut image, sb + 90, 0xEF53);

    // Group descriptor, block 2: bitmaps at 3 and 4, inode table at 5
    let gd = 2 * BLOCK_SIZE;
    put_u32(&mut image, gd, 3);
    put_u32(&mut image, gd + 4, 4);
    put_u32(&mut image, gd + 8, 5);
    put_u16(&mut image, gd + 12, (BLOCK_COUNT - USED_BLOCKS) as u16);
    put_u16(&mut image, gd + 14, (INODE_COUNT - USED_INODES) as u16);
    put_u16(&mut image, gd + 16, 1);

    // Bitmaps: bit i covers block/inode i + 1
    for bit in 0..USED_BLOCKS as usize {
        image[3 * BLOCK_SIZE + bit / 8] |= 1 << (bit % 8);
    }
    for bit in 0..USED_INODES as usize {
        image[4 * BLOCK_SIZE + bit / 8] |= 1 << (bit % 8);
    }

    // Inodes: root directory (block 9), foo (block 10), holey (no blocks)
    put_inode(&mut image, ROOT_INODE, 0x41ED, BLOCK_SIZE as u32, 9);
    put_inode(&mut image, 3, 0x81A4, PAYLOAD.len() as u32, 10);
    put_inode(&mut image, 4, 0x81A4, 6, 0);

    // Root directory entries
    let mut at = 9 * BLOCK_SIZE;
    at = put_dir_entry(&mut image, at, ROOT_INODE, b".");
    at = put_dir_entry(&mut image, at, ROOT_INODE, b"..");
    at = put_dir_entry(&mut image, at, 3, b"foo");
    put_dir_entry(&mut image, at, 4, b"holey");

    // foo's payload
    image[10 * BLOCK_SIZE..10 * BLOCK_SIZE + PAYLOAD.len()].copy_from_slice(PAYLOAD);

    RamDisk::from_bytes(image)
}

add_test!(mount_reads_the_volume_geometry, {
    let volume = Ext2::mount(build_image()).expect("The image should mount");
    assert_eq!(volume.block_size(), BLOCK_SIZE);

    // The descriptor's free counts complement the bitmap populations
    let (free_blocks, free_inodes) = volume.free_counts();
    let (used_blocks, used_inodes) = volume.bitmap_populations();
    assert_eq!(u32::from(free_blocks) + used_blocks as u32, BLOCK_COUNT);
    assert_eq!(u32::from(free_inodes) + used_inodes as u32, INODE_COUNT);
});

add_test!(lookup_finds_and_reads_files, {
    let mut volume = Ext2::mount(build_image()).expect("The image should mount");
    let root = volume.read_inode(ROOT_INODE).expect("The root should load");
    assert!(root.is_dir());

    let foo = volume
        .find_in_directory(&root, "foo")
        .expect("foo should be present");
    assert!(foo.is_file());
    assert_eq!(foo.size() as usize, PAYLOAD.len());
    assert_eq!(
        volume.read_to_vec(&foo).expect("foo should be readable"),
        PAYLOAD
    );

    assert!(matches!(
        volume.find_in_directory(&root, "missing"),
        Err(Ext2Error::NotFound)
    ));
    assert!(matches!(
        volume.lookup_path("/foo").map(|inode| inode.number),
        Ok(3)
    ));
});

add_test!(holes_read_as_zeros, {
    let mut volume = Ext2::mount(build_image()).expect("The image should mount");
    let holey = volume.lookup_path("holey").expect("holey should be present");
    let body = volume.read_to_vec(&holey).expect("holey should be readable");
    assert_eq!(body, [0; 6]);
});

add_test!(duplicate_creation_leaves_the_volume_unchanged, {
    let mut volume = Ext2::mount(build_image()).expect("The image should mount");
    let root = volume.read_inode(ROOT_INODE).expect("The root should load");

    let before_counts = volume.free_counts();
    let before_bits = volume.bitmap_populations();
    assert!(matches!(
        volume.create_file(&root, "foo"),
        Err(Ext2Error::Exists)
    ));
    assert_eq!(volume.free_counts(), before_counts);
    assert_eq!(volume.bitmap_populations(), before_bits);
});

add_test!(created_files_survive_a_remount, {
    let mut volume = Ext2::mount(build_image()).expect("The image should mount");
    let root = volume.read_inode(ROOT_INODE).expect("The root should load");

    let (free_blocks_before, free_inodes_before) = volume.free_counts();
    let mut bar = volume
        .create_file(&root, "bar")
        .expect("Creation should succeed");
    assert!(bar.is_file());
    assert_eq!(bar.size(), 0);
    assert_eq!(volume.free_counts().1, free_inodes_before - 1);

    let written = volume
        .write_file(&mut bar, PAYLOAD)
        .expect("The write should succeed");
    assert_eq!(written, PAYLOAD.len());
    // Growing the file consumed exactly one block
    assert_eq!(volume.free_counts().0, free_blocks_before - 1);

    // Everything must still be there after tearing the stack down
    let disk = volume.into_device().expect("Unmounting should flush");
    let mut volume = Ext2::mount(disk).expect("The image should remount");
    let bar = volume.lookup_path("bar").expect("bar should persist");
    assert_eq!(
        volume.read_to_vec(&bar).expect("bar should be readable"),
        PAYLOAD
    );

    // The free counts still complement the bitmaps
    let (free_blocks, free_inodes) = volume.free_counts();
    let (used_blocks, used_inodes) = volume.bitmap_populations();
    assert_eq!(u32::from(free_blocks) + used_blocks as u32, BLOCK_COUNT);
    assert_eq!(u32::from(free_inodes) + used_inodes as u32, INODE_COUNT);
});

add_test!(writes_roundtrip_across_block_boundaries, {
    let mut volume = Ext2::mount(build_image()).expect("The image should mount");
    let root = volume.read_inode(ROOT_INODE).expect("The root should load");

    let mut big = volume
        .create_file(&root, "big")
        .expect("Creation should succeed");
    // Three writes spanning a block boundary
    let chunks: [Vec<u8>; 3] = [
        vec![b'a'; 700],
        vec![b'b'; 700],
        vec![b'c'; 100],
    ];
    for chunk in &chunks {
        assert_eq!(
            volume.write_file(&mut big, chunk).expect("Writes should succeed"),
            chunk.len()
        );
    }

    let expected: Vec<u8> = chunks.concat();
    assert_eq!(
        volume.read_to_vec(&big).expect("big should be readable"),
        expected
    );
});
