#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(format_args_nl)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(libkernel::test_runner)]

extern crate alloc;

use alloc::vec;
use libkernel::add_test;
use libkernel::fs::cache::{BlockCache, CACHE_SIZE};
use libkernel::fs::device::RamDisk;

#[no_mangle]
fn kernel_main() {
    test_main();
}

const BLOCK_SIZE: usize = 1024;

add_test!(partial_writes_are_read_modify_write, {
    // Pre-pattern a block directly on the device
    let mut disk = RamDisk::new(256);
    let mut cache = BlockCache::new(disk, BLOCK_SIZE);
    cache
        .write_block(4, &vec![0xEE; BLOCK_SIZE], 0, BLOCK_SIZE)
        .expect("The full write should succeed");
    cache.flush_cache().expect("Flushing should succeed");
    disk = cache.into_device().expect("Unwrapping should flush");

    // A fresh cache patching 16 bytes must preserve the rest of the block
    let mut cache = BlockCache::new(disk, BLOCK_SIZE);
    cache
        .write_block(4, &[0x11; 16], 100, 16)
        .expect("The partial write should succeed");
    let mut block = vec![0_u8; BLOCK_SIZE];
    cache.read_block(4, &mut block).expect("The read should succeed");
    assert!(block[..100].iter().all(|&byte| byte == 0xEE));
    assert!(block[100..116].iter().all(|&byte| byte == 0x11));
    assert!(block[116..].iter().all(|&byte| byte == 0xEE));
});

add_test!(dirty_blocks_reach_the_device_on_flush, {
    let mut cache = BlockCache::new(RamDisk::new(256), BLOCK_SIZE);
    cache
        .write_block(7, &[0x42; 32], 0, 32)
        .expect("The write should succeed");

    // Not flushed yet: the device still holds zeros
    // (peeking requires tearing the cache down without flushing is not
    // possible; instead verify the flush path end to end)
    cache.flush_cache().expect("Flushing should succeed");
    let disk = cache.into_device().expect("Unwrapping should flush");
    assert!(disk.bytes()[7 * BLOCK_SIZE..7 * BLOCK_SIZE + 32]
        .iter()
        .all(|&byte| byte == 0x42));
});

add_test!(eviction_writes_back_the_least_recently_used, {
    let mut cache = BlockCache::new(RamDisk::new((CACHE_SIZE + 8) * 2), BLOCK_SIZE);

    // Dirty one block, then touch enough others to force its eviction
    cache
        .write_block(0, &[0x99; 8], 0, 8)
        .expect("The write should succeed");
    let mut scratch = vec![0_u8; BLOCK_SIZE];
    for block in 1..=CACHE_SIZE as u32 {
        cache
            .read_block(block, &mut scratch)
            .expect("Reads should succeed");
    }

    // Block 0 was evicted and must have been written back; reloading it
    // shows the patch
    cache.read_block(0, &mut scratch).expect("The reload should succeed");
    assert!(scratch[..8].iter().all(|&byte| byte == 0x99));
    assert!(scratch[8..].iter().all(|&byte| byte == 0));
});

add_test!(byte_granular_io_crosses_block_boundaries, {
    let mut cache = BlockCache::new(RamDisk::new(256), BLOCK_SIZE);

    let pattern: alloc::vec::Vec<u8> = (0..=255).cycle().take(3000).map(|b| b as u8).collect();
    cache
        .write_all(BLOCK_SIZE as u64 - 500, &pattern)
        .expect("The write should succeed");

    let mut readback = vec![0_u8; 3000];
    cache
        .read_all(BLOCK_SIZE as u64 - 500, &mut readback)
        .expect("The read should succeed");
    assert_eq!(readback, pattern);
});
