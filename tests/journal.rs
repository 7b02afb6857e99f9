#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(format_args_nl)]
#![reexport_test_harness_main = "test_main"]
#![test_runner(libkernel::test_runner)]

extern crate alloc;

use alloc::vec;
use libkernel::add_test;
use libkernel::fs::cache::BlockCache;
use libkernel::fs::device::RamDisk;
use libkernel::fs::journal::{Journal, JournalHeader, JournalSuperblock, JOURNAL_MAGIC, PAYLOAD_SIZE};

#[no_mangle]
fn kernel_main() {
    test_main();
}

/// Block size of the journal experiments
const BLOCK_SIZE: usize = 1024;
/// Where the journal area starts on the scratch disk
const JOURNAL_START: u32 = 32;

/// A journal over a scratch RAM disk
fn scratch_journal() -> (Journal, BlockCache<RamDisk>) {
    let superblock = JournalSuperblock {
        header: JournalHeader {
            magic: JOURNAL_MAGIC,
            block_type: 4,
            transaction_id: 0,
        },
        block_size: BLOCK_SIZE as u32,
        total_blocks: 16,
        first_info_block: 0,
        sequence_number: 1,
        start_block: JOURNAL_START,
    };
    (
        Journal::new(&superblock),
        BlockCache::new(RamDisk::new(128), BLOCK_SIZE),
    )
}

add_test!(committed_transactions_replay_onto_their_targets, {
    let (mut journal, mut cache) = scratch_journal();
    let payload = vec![0x5A_u8; PAYLOAD_SIZE];

    journal.start_transaction(&mut cache).expect("TxStart should write");
    journal
        .log_metadata_block(&mut cache, 5, &payload)
        .expect("The shadow block should write");
    journal.commit_transaction(&mut cache).expect("TxEnd should write");

    let applied = journal.replay(&mut cache).expect("Replay should succeed");
    assert_eq!(applied, 1);

    let mut target = vec![0_u8; BLOCK_SIZE];
    cache.read_block(5, &mut target).expect("The target should read");
    assert_eq!(&target[..PAYLOAD_SIZE], payload.as_slice());

    // The write pointer reset: a second sweep finds nothing
    assert_eq!(journal.replay(&mut cache).expect("Replay should succeed"), 0);
});

add_test!(unterminated_transactions_are_ignored, {
    let (mut journal, mut cache) = scratch_journal();
    let payload = vec![0xC3_u8; PAYLOAD_SIZE];

    journal.start_transaction(&mut cache).expect("TxStart should write");
    journal
        .log_metadata_block(&mut cache, 7, &payload)
        .expect("The shadow block should write");
    // No commit: the tail transaction must not touch block 7

    let applied = journal.replay(&mut cache).expect("Replay should succeed");
    assert_eq!(applied, 0);

    let mut target = vec![0_u8; BLOCK_SIZE];
    cache.read_block(7, &mut target).expect("The target should read");
    assert!(target.iter().all(|&byte| byte == 0));
});

add_test!(replay_applies_transactions_in_order, {
    let (mut journal, mut cache) = scratch_journal();

    for round in 1..=3_u8 {
        let payload = vec![round; PAYLOAD_SIZE];
        journal.start_transaction(&mut cache).expect("TxStart should write");
        journal
            .log_metadata_block(&mut cache, 9, &payload)
            .expect("The shadow block should write");
        journal.commit_transaction(&mut cache).expect("TxEnd should write");
    }

    assert_eq!(journal.replay(&mut cache).expect("Replay should succeed"), 3);

    // The last transaction wins
    let mut target = vec![0_u8; BLOCK_SIZE];
    cache.read_block(9, &mut target).expect("The target should read");
    assert!(target[..PAYLOAD_SIZE].iter().all(|&byte| byte == 3));
});
