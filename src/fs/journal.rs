//! The metadata journal's on-disk layout and transaction machinery.
//!
//! Fields are big-endian on disk. A transaction is a `TxStart` block, any
//! number of metadata blocks (each tagging the filesystem block it shadows),
//! and a `TxEnd` carrying the same transaction ID. Replay exists but the
//! mainline mount does not call it; the volume and the journal are not yet
//! wired together end-to-end.

use super::cache::BlockCache;
use super::device::{DeviceStatus, SectorDevice};

/// The journal signature
pub const JOURNAL_MAGIC: u32 = 0xC03B_3998;
/// Bytes of the on-disk header
const HEADER_SIZE: usize = 12;
/// Payload bytes carried by one metadata block: the remainder of a 1 KiB
/// journal block after the header and the target-block word
pub const PAYLOAD_SIZE: usize = 1024 - HEADER_SIZE - 4;

/// Tags in a journal block's `block_type` field
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Opens a transaction
    TxStart = 1,
    /// Shadows one filesystem metadata block
    Metadata = 2,
    /// Commits the transaction
    TxEnd = 3,
}

/// The common 12-byte header of every journal block
#[derive(Debug, Clone, Copy)]
pub struct JournalHeader {
    /// Must equal `JOURNAL_MAGIC`
    pub magic: u32,
    /// One of the `BlockKind` tags
    pub block_type: u32,
    /// The owning transaction
    pub transaction_id: u32,
}

impl JournalHeader {
    /// Serializes the header, big-endian
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.block_type.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes
    }

    /// Deserializes a header from the front of a journal block
    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            magic: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            block_type: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            transaction_id: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
        }
    }
}

/// The journal superblock, stored in the journal's reserved inode. Layout
/// matches ext3's descriptor-free variant.
#[derive(Debug, Clone, Copy)]
pub struct JournalSuperblock {
    /// The common header (`magic`, a superblock type tag, a sequence)
    pub header: JournalHeader,
    /// Journal block size in bytes
    pub block_size: u32,
    /// Total journal blocks
    pub total_blocks: u32,
    /// First block of journal information
    pub first_info_block: u32,
    /// First expected transaction ID
    pub sequence_number: u32,
    /// First block of the journal area
    pub start_block: u32,
}

impl JournalSuperblock {
    /// Parses the fixed prefix of a journal superblock
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let word = |at: usize| u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap());
        Self {
            header: JournalHeader::from_bytes(bytes),
            block_size: word(12),
            total_blocks: word(16),
            first_info_block: word(20),
            sequence_number: word(24),
            start_block: word(28),
        }
    }
}

/// A live journal over some span of volume blocks
pub struct Journal {
    /// First block of the journal area
    start: u32,
    /// One past the last journal block
    end: u32,
    /// Where the next journal block goes
    write_pointer: u32,
    /// The transaction currently being written
    current_transaction: u32,
}

impl Journal {
    /// Builds the journal state from its superblock
    pub fn new(superblock: &JournalSuperblock) -> Self {
        Self {
            start: superblock.start_block,
            end: superblock.start_block + superblock.total_blocks,
            write_pointer: superblock.start_block,
            current_transaction: superblock.sequence_number,
        }
    }

    /// First block of the journal area
    pub fn start_block(&self) -> u32 {
        self.start
    }

    /// Appends one journal block
    fn append<D: SectorDevice>(
        &mut self,
        cache: &mut BlockCache<D>,
        bytes: &[u8],
    ) -> Result<(), DeviceStatus> {
        assert!(self.write_pointer < self.end, "The journal area is full");
        cache.write_block(self.write_pointer, bytes, 0, bytes.len())?;
        self.write_pointer += 1;
        Ok(())
    }

    /// Opens a transaction with a `TxStart` marker
    pub fn start_transaction<D: SectorDevice>(
        &mut self,
        cache: &mut BlockCache<D>,
    ) -> Result<(), DeviceStatus> {
        let header = JournalHeader {
            magic: JOURNAL_MAGIC,
            block_type: BlockKind::TxStart as u32,
            transaction_id: self.current_transaction,
        };
        self.append(cache, &header.to_bytes())
    }

    /// Logs a shadow copy of filesystem block `fs_block` into the journal
    pub fn log_metadata_block<D: SectorDevice>(
        &mut self,
        cache: &mut BlockCache<D>,
        fs_block: u32,
        data: &[u8],
    ) -> Result<(), DeviceStatus> {
        assert!(data.len() >= PAYLOAD_SIZE);
        let header = JournalHeader {
            magic: JOURNAL_MAGIC,
            block_type: BlockKind::Metadata as u32,
            transaction_id: self.current_transaction,
        };
        let mut block = [0_u8; HEADER_SIZE + 4 + PAYLOAD_SIZE];
        block[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        block[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&fs_block.to_be_bytes());
        block[HEADER_SIZE + 4..].copy_from_slice(&data[..PAYLOAD_SIZE]);
        self.append(cache, &block)
    }

    /// Closes the open transaction with a `TxEnd` marker and advances the
    /// transaction ID
    pub fn commit_transaction<D: SectorDevice>(
        &mut self,
        cache: &mut BlockCache<D>,
    ) -> Result<(), DeviceStatus> {
        let header = JournalHeader {
            magic: JOURNAL_MAGIC,
            block_type: BlockKind::TxEnd as u32,
            transaction_id: self.current_transaction,
        };
        self.append(cache, &header.to_bytes())?;
        self.current_transaction += 1;
        Ok(())
    }

    /// Replays committed transactions onto their target blocks. The journal
    /// is scanned to each transaction's `TxEnd` before any of its blocks are
    /// applied, so an unterminated tail transaction is ignored entirely.
    /// Returns the number of metadata blocks applied; after a sweep with no
    /// dangling transaction the write pointer resets to the journal start.
    pub fn replay<D: SectorDevice>(
        &mut self,
        cache: &mut BlockCache<D>,
    ) -> Result<u32, DeviceStatus> {
        let block_size = cache.block_size();
        let mut block = alloc::vec![0_u8; block_size];
        let mut applied = 0_u32;
        let mut position = self.start;
        let mut dangling = false;

        while position < self.write_pointer {
            cache.read_block(position, &mut block)?;
            let header = JournalHeader::from_bytes(&block);
            if header.magic != JOURNAL_MAGIC || header.block_type != BlockKind::TxStart as u32 {
                break;
            }
            let transaction = header.transaction_id;

            // Scan ahead to this transaction's TxEnd before touching anything
            let body = position + 1;
            let mut end = None;
            let mut probe = body;
            while probe < self.write_pointer {
                cache.read_block(probe, &mut block)?;
                let header = JournalHeader::from_bytes(&block);
                if header.magic != JOURNAL_MAGIC {
                    break;
                }
                if header.block_type == BlockKind::TxEnd as u32
                    && header.transaction_id == transaction
                {
                    end = Some(probe);
                    break;
                }
                probe += 1;
            }
            let Some(end) = end else {
                dangling = true;
                break;
            };

            for entry in body..end {
                cache.read_block(entry, &mut block)?;
                let header = JournalHeader::from_bytes(&block);
                if header.block_type != BlockKind::Metadata as u32 {
                    continue;
                }
                let target =
                    u32::from_be_bytes(block[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap());
                cache.write_block(
                    target,
                    &block[HEADER_SIZE + 4..HEADER_SIZE + 4 + PAYLOAD_SIZE],
                    0,
                    PAYLOAD_SIZE,
                )?;
                applied += 1;
            }
            position = end + 1;
        }

        if !dangling {
            self.write_pointer = self.start;
        }
        Ok(applied)
    }
}
